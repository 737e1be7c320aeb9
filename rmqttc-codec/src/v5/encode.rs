use bytes::{BufMut, BytesMut};
use bytestring::ByteString;

use super::packet::{property_type as pt, *};
use super::{UserProperties, UserProperty};
use crate::error::EncodeError;
use crate::types::packet_type;
use crate::utils::{write_variable_length, Encode};

/// Optional content the encoder may leave out to fit the peer's maximum packet size.
///
/// Levels are cumulative: omitting the reason string implies user properties are gone too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Omit {
    Nothing,
    UserProperties,
    ReasonString,
}

impl Omit {
    pub(crate) const LEVELS: [Omit; 3] = [Omit::Nothing, Omit::UserProperties, Omit::ReasonString];

    #[inline]
    pub(crate) fn user_properties(self) -> bool {
        self >= Omit::UserProperties
    }

    #[inline]
    pub(crate) fn reason_string(self) -> bool {
        self >= Omit::ReasonString
    }
}

pub(crate) trait EncodeLtd {
    /// Size of the variable header and payload, i.e. the remaining length.
    fn encoded_size(&self, omit: Omit) -> usize;

    fn encode(&self, buf: &mut BytesMut, size: u32, omit: Omit) -> Result<(), EncodeError>;
}

impl EncodeLtd for Packet {
    fn encoded_size(&self, omit: Omit) -> usize {
        match self {
            Packet::Connect(connect) => connect.encoded_size(omit),
            Packet::Publish(publish) => publish.encoded_size(omit),
            Packet::ConnectAck(ack) => ack.encoded_size(omit),
            Packet::PublishAck(ack) | Packet::PublishReceived(ack) => ack.encoded_size(omit),
            Packet::PublishRelease(ack) | Packet::PublishComplete(ack) => ack.encoded_size(omit),
            Packet::Subscribe(sub) => sub.encoded_size(omit),
            Packet::SubscribeAck(ack) => ack.encoded_size(omit),
            Packet::Unsubscribe(unsub) => unsub.encoded_size(omit),
            Packet::UnsubscribeAck(ack) => ack.encoded_size(omit),
            Packet::PingRequest | Packet::PingResponse => 0,
            Packet::Disconnect(disconnect) => disconnect.encoded_size(omit),
            Packet::Auth(auth) => auth.encoded_size(omit),
        }
    }

    fn encode(&self, buf: &mut BytesMut, size: u32, omit: Omit) -> Result<(), EncodeError> {
        let first_byte = match self {
            Packet::Publish(publish) => {
                packet_type::PUBLISH_START
                    | (u8::from(publish.qos) << 1)
                    | ((publish.dup as u8) << 3)
                    | (publish.retain as u8)
            }
            _ => self.packet_type(),
        };
        buf.put_u8(first_byte);
        write_variable_length(size, buf)?;
        match self {
            Packet::Connect(connect) => connect.encode(buf, size, omit),
            Packet::ConnectAck(ack) => ack.encode(buf, size, omit),
            Packet::Publish(publish) => publish.encode(buf, size, omit),
            Packet::PublishAck(ack) | Packet::PublishReceived(ack) => ack.encode(buf, size, omit),
            Packet::PublishRelease(ack) | Packet::PublishComplete(ack) => ack.encode(buf, size, omit),
            Packet::Subscribe(sub) => sub.encode(buf, size, omit),
            Packet::SubscribeAck(ack) => ack.encode(buf, size, omit),
            Packet::Unsubscribe(unsub) => unsub.encode(buf, size, omit),
            Packet::UnsubscribeAck(ack) => ack.encode(buf, size, omit),
            Packet::PingRequest | Packet::PingResponse => Ok(()),
            Packet::Disconnect(disconnect) => disconnect.encode(buf, size, omit),
            Packet::Auth(auth) => auth.encode(buf, size, omit),
        }
    }
}

/// Size of the user properties and reason string that survive `omit`.
pub(crate) fn encoded_size_opt_props(
    user_props: &[UserProperty],
    reason_str: &Option<ByteString>,
    omit: Omit,
) -> usize {
    let mut len = 0;
    if !omit.user_properties() {
        len += user_props.iter().map(|up| 1 + up.encoded_size()).sum::<usize>();
    }
    if !omit.reason_string() {
        len += encoded_property_size(reason_str);
    }
    len
}

pub(crate) fn encode_opt_props(
    user_props: &[UserProperty],
    reason_str: &Option<ByteString>,
    buf: &mut BytesMut,
    omit: Omit,
) -> Result<(), EncodeError> {
    if !omit.user_properties() {
        for up in user_props.iter() {
            buf.put_u8(pt::USER);
            up.encode(buf)?;
        }
    }
    if !omit.reason_string() {
        encode_property(reason_str, pt::REASON_STRING, buf)?;
    }
    Ok(())
}

/// Size of the user properties unless `omit` drops them.
#[inline]
pub(super) fn encoded_user_props_size(user_props: &UserProperties, omit: Omit) -> usize {
    if omit.user_properties() {
        0
    } else {
        user_props.encoded_size()
    }
}

#[inline]
pub(super) fn encode_user_props(
    user_props: &UserProperties,
    buf: &mut BytesMut,
    omit: Omit,
) -> Result<(), EncodeError> {
    if omit.user_properties() {
        Ok(())
    } else {
        user_props.encode(buf)
    }
}

pub(super) fn encoded_property_size<T: Encode>(v: &Option<T>) -> usize {
    v.as_ref().map_or(0, |v| 1 + v.encoded_size()) // 1 - property type byte
}

pub(super) fn encoded_property_size_default<T: Encode + PartialEq>(v: &T, default: T) -> usize {
    if *v == default {
        0
    } else {
        1 + v.encoded_size() // 1 - property type byte
    }
}

pub(super) fn encode_property<T: Encode>(
    v: &Option<T>,
    prop_type: u8,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if let Some(v) = v {
        buf.put_u8(prop_type);
        v.encode(buf)
    } else {
        Ok(())
    }
}

pub(super) fn encode_property_default<T: Encode + PartialEq>(
    v: &T,
    default: T,
    prop_type: u8,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if *v != default {
        buf.put_u8(prop_type);
        v.encode(buf)
    } else {
        Ok(())
    }
}

/// Writes a property block: its variable length prefix followed by the properties.
pub(super) fn write_props_len(prop_len: usize, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let prop_len = u32::try_from(prop_len).map_err(|_| EncodeError::VariableIntegerExceeded)?;
    write_variable_length(prop_len, buf)
}

/// Bytes taken by a variable byte integer; 5 marks a value the protocol cannot express.
pub(crate) fn var_int_len(val: usize) -> u32 {
    match val {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        2_097_152..=268_435_455 => 4,
        _ => 5,
    }
}

/// Property block size including its own length prefix.
#[inline]
pub(crate) fn props_block_size(prop_len: usize) -> usize {
    var_int_len(prop_len) as usize + prop_len
}

impl Encode for UserProperties {
    fn encoded_size(&self) -> usize {
        let mut len = 0;
        for prop in self {
            len += 1 + prop.encoded_size();
        }
        len
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        for prop in self {
            buf.put_u8(pt::USER);
            prop.encode(buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use test_case::test_case;

    use super::*;

    fn encode_packet(pkt: &Packet, omit: Omit) -> BytesMut {
        let mut buf = BytesMut::new();
        let size = pkt.encoded_size(omit);
        pkt.encode(&mut buf, size as u32, omit).unwrap();
        buf
    }

    #[test_case(0, 1)]
    #[test_case(127, 1)]
    #[test_case(128, 2)]
    #[test_case(16_383, 2)]
    #[test_case(16_384, 3)]
    #[test_case(2_097_151, 3)]
    #[test_case(2_097_152, 4)]
    #[test_case(268_435_455, 4)]
    #[test_case(268_435_456, 5)]
    fn test_var_int_len(val: usize, expected: u32) {
        assert_eq!(var_int_len(val), expected);
    }

    #[test]
    fn test_omit_levels_are_cumulative() {
        assert!(!Omit::Nothing.user_properties());
        assert!(Omit::UserProperties.user_properties());
        assert!(!Omit::UserProperties.reason_string());
        assert!(Omit::ReasonString.user_properties());
        assert!(Omit::ReasonString.reason_string());
    }

    #[test]
    fn test_ping_packets() {
        assert_eq!(&encode_packet(&Packet::PingRequest, Omit::Nothing)[..], b"\xc0\x00");
        assert_eq!(&encode_packet(&Packet::PingResponse, Omit::Nothing)[..], b"\xd0\x00");
    }

    #[test]
    fn test_publish_first_byte() {
        let mut publish = Publish::new("a/b", Bytes::from_static(b"hi"), QoS::ExactlyOnce, true);
        publish.dup = true;
        publish.packet_id = NonZeroU16::new(10);
        let buf = encode_packet(&publish.into(), Omit::Nothing);
        assert_eq!(&buf[..], b"\x3d\x0a\x00\x03a/b\x00\x0a\x00hi");
    }

    #[test]
    fn test_pubrel_fixed_header_flags() {
        let rel = Packet::PublishRelease(PublishAck2::new(NonZeroU16::new(3).unwrap(), PublishAck2Reason::Success));
        assert_eq!(&encode_packet(&rel, Omit::Nothing)[..], b"\x62\x02\x00\x03");
    }

    #[test]
    fn test_user_properties_dropped_before_reason_string() {
        let user_props: UserProperties = vec![("a".into(), "b".into())];
        let reason = Some(ByteString::from_static("r"));
        assert_eq!(encoded_size_opt_props(&user_props, &reason, Omit::Nothing), 7 + 4);
        assert_eq!(encoded_size_opt_props(&user_props, &reason, Omit::UserProperties), 4);
        assert_eq!(encoded_size_opt_props(&user_props, &reason, Omit::ReasonString), 0);

        let mut buf = BytesMut::new();
        encode_opt_props(&user_props, &reason, &mut buf, Omit::UserProperties).unwrap();
        assert_eq!(&buf[..], b"\x1f\x00\x01r");
    }
}
