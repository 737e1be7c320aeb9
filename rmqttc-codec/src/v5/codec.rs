use std::cell::Cell;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    decode::decode_packet,
    encode::{var_int_len, EncodeLtd, Omit},
    Packet,
};
use crate::error::{DecodeError, EncodeError};
use crate::types::{FixedHeader, MAX_PACKET_SIZE};
use crate::utils::decode_variable_length;

/// MQTT v5 codec.
///
/// Size limits count the whole packet, fixed header included, as MQTT v5 Maximum Packet Size does.
#[derive(Debug, Clone)]
pub struct Codec {
    state: Cell<DecodeState>,
    max_in_size: Cell<u32>,
    max_out_size: Cell<u32>,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    FrameHeader,
    Frame(FixedHeader),
}

impl Codec {
    /// Create `Codec` instance
    pub fn new(max_in_size: u32, max_out_size: u32) -> Self {
        Codec {
            state: Cell::new(DecodeState::FrameHeader),
            max_in_size: Cell::new(max_in_size),
            max_out_size: Cell::new(max_out_size),
        }
    }

    /// Max inbound packet size, `0` is unlimited.
    pub fn max_inbound_size(&self) -> u32 {
        self.max_in_size.get()
    }

    /// Max outbound packet size, `0` is unlimited.
    pub fn max_outbound_size(&self) -> u32 {
        self.max_out_size.get()
    }

    pub fn set_max_inbound_size(&mut self, size: u32) {
        self.max_in_size.set(size);
    }

    /// Set max outbound packet size, usually the Maximum Packet Size granted in CONNACK.
    pub fn set_max_outbound_size(&mut self, size: u32) {
        self.max_out_size.set(size);
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

#[inline]
fn total_size(remaining_length: usize) -> usize {
    1 + var_int_len(remaining_length) as usize + remaining_length
}

impl Decoder for Codec {
    type Item = (Packet, u32);
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        loop {
            match self.state.get() {
                DecodeState::FrameHeader => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let src_slice = src.as_ref();
                    let first_byte = src_slice[0];
                    match decode_variable_length(&src_slice[1..])? {
                        Some((remaining_length, consumed)) => {
                            let max_in_size = self.max_in_size.get() as usize;
                            let packet_size = 1 + consumed + remaining_length as usize;
                            if max_in_size != 0 && max_in_size < packet_size {
                                log::debug!(
                                    "MaxSizeExceeded max-size: {}, packet size: {}",
                                    max_in_size,
                                    packet_size
                                );
                                return Err(DecodeError::MaxSizeExceeded);
                            }
                            src.advance(consumed + 1);
                            self.state.set(DecodeState::Frame(FixedHeader { first_byte, remaining_length }));
                            let remaining_length = remaining_length as usize;
                            if src.len() < remaining_length {
                                src.reserve(remaining_length - src.len());
                                return Ok(None);
                            }
                        }
                        None => {
                            return Ok(None);
                        }
                    }
                }
                DecodeState::Frame(fixed) => {
                    if src.len() < fixed.remaining_length as usize {
                        return Ok(None);
                    }
                    let packet_buf = src.split_to(fixed.remaining_length as usize).freeze();
                    let packet = decode_packet(packet_buf, fixed.first_byte)?;
                    self.state.set(DecodeState::FrameHeader);
                    src.reserve(5); // enough to fix 1 fixed header byte + 4 bytes max variable packet length
                    return Ok(Some((packet, fixed.remaining_length)));
                }
            }
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let max_out_size = self.max_out_size.get() as usize;
        let (size, omit) = Omit::LEVELS
            .iter()
            .map(|&omit| (item.encoded_size(omit), omit))
            .find(|(size, _)| max_out_size == 0 || total_size(*size) <= max_out_size)
            .ok_or(EncodeError::MaximumPacketSizeExceeded)?;
        let size = u32::try_from(size)
            .ok()
            .filter(|size| *size <= MAX_PACKET_SIZE)
            .ok_or(EncodeError::VariableIntegerExceeded)?;
        if omit != Omit::Nothing {
            log::debug!("packet trimmed ({:?}) to fit max outbound size {}", omit, max_out_size);
        }
        dst.reserve(size as usize + 5);
        item.encode(dst, size, omit)
    }
}

#[cfg(test)]
mod tests {
    use std::num::{NonZeroU16, NonZeroU32};

    use bytes::Bytes;
    use test_case::test_case;

    use super::*;
    use crate::types::{Publish, QoS};
    use crate::v5::{
        Auth, AuthReasonCode, Disconnect, DisconnectReasonCode, PublishAck, PublishAck2, PublishAck2Reason,
        PublishAckReason, PublishProperties, RetainHandling, Subscribe, SubscribeAck, SubscribeAckReason,
        SubscriptionOptions, Unsubscribe, UnsubscribeAck, UnsubscribeAckReason, UserProperties,
    };

    fn encode(codec: &mut Codec, pkt: Packet) -> Result<BytesMut, EncodeError> {
        let mut buf = BytesMut::new();
        codec.encode(pkt, &mut buf)?;
        Ok(buf)
    }

    #[test]
    fn test_max_inbound_size_counts_fixed_header() {
        let mut codec = Codec::new(10, 0);
        let mut buf = BytesMut::from(&b"\xe0\x09"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::MaxSizeExceeded)));

        let mut codec = Codec::new(10, 0);
        let mut buf = BytesMut::from(&b"\x40\x02\x00\x01"[..]);
        assert!(matches!(codec.decode(&mut buf), Ok(Some((Packet::PublishAck(_), 2)))));
    }

    #[test]
    fn test_partial_frames() {
        let mut codec = Codec::default();
        let mut buf = BytesMut::from(&b"\x40"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x02\x00");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x01\xc0");
        let (pkt, _) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pkt, Packet::PublishAck(PublishAck::new(NonZeroU16::new(1).unwrap(), PublishAckReason::Success)));
        assert_eq!(&buf[..], b"\xc0");
    }

    #[test]
    fn test_success_puback_is_four_bytes() {
        let pkt = Packet::PublishAck(PublishAck::new(NonZeroU16::new(1).unwrap(), PublishAckReason::Success));
        assert_eq!(&encode(&mut Codec::default(), pkt).unwrap()[..], b"\x40\x02\x00\x01");
    }

    #[test]
    fn test_trim_to_max_outbound_size() {
        let ack = PublishAck {
            packet_id: NonZeroU16::new(1).unwrap(),
            reason_code: PublishAckReason::UnspecifiedError,
            properties: vec![("key".into(), "value".into())],
            reason_string: Some("reason".into()),
        };

        // 2 + 1 + (1 + 13 + 9) remaining
        assert_eq!(encode(&mut Codec::new(0, 28), ack.clone().into()).unwrap().len(), 28);

        let buf = encode(&mut Codec::new(0, 27), ack.clone().into()).unwrap();
        assert_eq!(&buf[..], b"\x40\x0d\x00\x01\x80\x09\x1f\x00\x06reason");

        let buf = encode(&mut Codec::new(0, 14), ack.into()).unwrap();
        assert_eq!(&buf[..], b"\x40\x03\x00\x01\x80");
    }

    #[test]
    fn test_max_outbound_size_exceeded() {
        let publish = Publish {
            properties: Some(PublishProperties::default()),
            ..Publish::new("topic", Bytes::from_static(&[0u8; 64]), QoS::AtMostOnce, false)
        };
        assert!(matches!(
            encode(&mut Codec::new(0, 32), publish.clone().into()),
            Err(EncodeError::MaximumPacketSizeExceeded)
        ));
        // 2 + 7 + 1 + 64 bytes
        assert_eq!(encode(&mut Codec::new(0, 74), publish.into()).unwrap().len(), 74);
    }

    #[test]
    fn test_normal_disconnect() {
        let buf = encode(&mut Codec::default(), Disconnect::default().into()).unwrap();
        assert_eq!(&buf[..], b"\xe0\x00");

        let mut codec = Codec::default();
        let pkt = Disconnect::new(DisconnectReasonCode::ProtocolError).with_reason_string("alias");
        assert_eq!(&encode(&mut codec, pkt.into()).unwrap()[..], b"\xe0\x0a\x82\x08\x1f\x00\x05alias");
    }

    #[test]
    fn test_ping_with_body_is_rejected() {
        let mut buf = BytesMut::from(&b"\xd0\x02\xde\xad"[..]);
        assert!(Codec::default().decode(&mut buf).is_err());
    }

    fn id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn props() -> UserProperties {
        vec![("key".into(), "value".into())]
    }

    fn publish_all_properties() -> Packet {
        Publish {
            dup: true,
            retain: true,
            qos: QoS::ExactlyOnce,
            topic: "a/b".into(),
            packet_id: Some(id(7)),
            payload: Bytes::from_static(b"payload"),
            properties: Some(PublishProperties {
                topic_alias: Some(3),
                correlation_data: Some(Bytes::from_static(b"corr")),
                message_expiry_interval: NonZeroU32::new(60),
                content_type: Some("text/plain".into()),
                user_properties: props(),
                is_utf8_payload: true,
                response_topic: Some("reply/to".into()),
                subscription_ids: vec![NonZeroU32::new(1).unwrap(), NonZeroU32::new(300).unwrap()],
            }),
        }
        .into()
    }

    fn publish_alias_only() -> Packet {
        Publish {
            properties: Some(PublishProperties { topic_alias: Some(5), ..Default::default() }),
            ..Publish::new("", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
        }
        .into()
    }

    fn subscribe() -> Packet {
        let opts = SubscriptionOptions {
            qos: QoS::ExactlyOnce,
            no_local: true,
            retain_as_published: true,
            retain_handling: RetainHandling::NoAtSubscribe,
        };
        Packet::Subscribe(Subscribe {
            packet_id: id(9),
            id: NonZeroU32::new(77),
            user_properties: props(),
            topic_filters: vec![("a/#".into(), opts), ("b/+".into(), SubscriptionOptions::default())],
        })
    }

    fn unsubscribe() -> Packet {
        Packet::Unsubscribe(Unsubscribe {
            user_properties: props(),
            ..Unsubscribe::new(id(10), vec!["a/#".into(), "b/+".into()])
        })
    }

    fn suback() -> Packet {
        Packet::SubscribeAck(SubscribeAck {
            packet_id: id(9),
            properties: props(),
            reason_string: Some("partly".into()),
            status: vec![SubscribeAckReason::GrantedQos1, SubscribeAckReason::NotAuthorized],
        })
    }

    fn unsuback() -> Packet {
        Packet::UnsubscribeAck(UnsubscribeAck {
            packet_id: id(10),
            properties: props(),
            reason_string: Some("gone".into()),
            status: vec![UnsubscribeAckReason::Success, UnsubscribeAckReason::NoSubscriptionExisted],
        })
    }

    fn ack(reason_code: PublishAckReason) -> PublishAck {
        PublishAck { packet_id: id(4), reason_code, properties: props(), reason_string: Some("quota".into()) }
    }

    fn ack2() -> PublishAck2 {
        PublishAck2 {
            packet_id: id(4),
            reason_code: PublishAck2Reason::PacketIdNotFound,
            properties: props(),
            reason_string: Some("unknown".into()),
        }
    }

    fn disconnect() -> Packet {
        Disconnect {
            session_expiry_interval_secs: Some(30),
            server_reference: Some("other:1883".into()),
            user_properties: props(),
            ..Disconnect::new(DisconnectReasonCode::UseAnotherServer).with_reason_string("moved")
        }
        .into()
    }

    #[test_case(publish_all_properties(); "publish_all_properties")]
    #[test_case(publish_alias_only(); "publish_alias_only")]
    #[test_case(subscribe(); "subscribe")]
    #[test_case(unsubscribe(); "unsubscribe")]
    #[test_case(suback(); "suback")]
    #[test_case(unsuback(); "unsuback")]
    #[test_case(Packet::PublishAck(ack(PublishAckReason::QuotaExceeded)); "puback_error")]
    #[test_case(Packet::PublishReceived(ack(PublishAckReason::NotAuthorized)); "pubrec_error")]
    #[test_case(Packet::PublishRelease(ack2()); "pubrel_error")]
    #[test_case(Packet::PublishComplete(ack2()); "pubcomp_error")]
    #[test_case(disconnect(); "disconnect")]
    #[test_case(Packet::PingRequest; "pingreq")]
    #[test_case(Packet::PingResponse; "pingresp")]
    fn test_round_trip(pkt: Packet) {
        let mut codec = Codec::default();
        let mut buf = encode(&mut codec, pkt.clone()).unwrap();
        let len = buf.len();
        let (decoded, remaining_length) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(total_size(remaining_length as usize), len);
        assert!(buf.is_empty());
    }

    fn auth() -> Packet {
        Packet::Auth(Auth {
            reason_string: Some("why".into()),
            user_properties: props(),
            ..Auth::continue_auth("M".into(), None)
        })
    }

    fn without_props(pkt: Packet) -> Packet {
        match pkt {
            Packet::Subscribe(sub) => Packet::Subscribe(Subscribe { user_properties: Vec::new(), ..sub }),
            Packet::Unsubscribe(unsub) => Packet::Unsubscribe(Unsubscribe { user_properties: Vec::new(), ..unsub }),
            Packet::Auth(auth) => Packet::Auth(Auth { user_properties: Vec::new(), ..auth }),
            other => other,
        }
    }

    // subscribe: 32 bytes in full, 19 without user properties
    #[test_case(subscribe(), 31, without_props(subscribe()); "subscribe_drops_user_properties")]
    #[test_case(subscribe(), 32, subscribe(); "subscribe_fits")]
    // unsubscribe: 28 bytes in full, 15 without user properties
    #[test_case(unsubscribe(), 20, without_props(unsubscribe()); "unsubscribe_drops_user_properties")]
    // auth: 27 bytes in full, 14 without user properties, 8 without the reason string
    #[test_case(auth(), 20, without_props(auth()); "auth_drops_user_properties")]
    #[test_case(auth(), 10, Packet::Auth(Auth::continue_auth("M".into(), None)); "auth_drops_reason_string")]
    fn test_trimmed_packet_fits(pkt: Packet, max_out_size: u32, expected: Packet) {
        let mut buf = encode(&mut Codec::new(0, max_out_size), pkt).unwrap();
        assert!(buf.len() <= max_out_size as usize, "{} > {}", buf.len(), max_out_size);
        let (decoded, _) = Codec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, expected);
    }

    #[test_case(subscribe(), 18; "subscribe")]
    #[test_case(unsubscribe(), 14; "unsubscribe")]
    #[test_case(auth(), 7; "auth")]
    fn test_untrimmable_packet_is_rejected(pkt: Packet, max_out_size: u32) {
        assert!(matches!(encode(&mut Codec::new(0, max_out_size), pkt), Err(EncodeError::MaximumPacketSizeExceeded)));
    }
}
