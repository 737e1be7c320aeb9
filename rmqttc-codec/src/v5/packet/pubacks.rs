use std::num::NonZeroU16;

use bytes::{Buf, Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use super::ack_props;
use crate::error::{DecodeError, EncodeError};
use crate::utils::Decode;
use crate::v5::{encode::*, UserProperties};

/// PUBACK/PUBREC message content
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PublishAck {
    /// Packet Identifier
    pub packet_id: NonZeroU16,
    pub reason_code: PublishAckReason,
    pub properties: UserProperties,
    pub reason_string: Option<ByteString>,
}

/// PUBREL/PUBCOMP message content
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PublishAck2 {
    /// Packet Identifier
    pub packet_id: NonZeroU16,
    pub reason_code: PublishAck2Reason,
    pub properties: UserProperties,
    pub reason_string: Option<ByteString>,
}

prim_enum! {
    /// PUBACK / PUBREC reason codes
    #[derive(Deserialize, Serialize)]
    pub enum PublishAckReason {
        Success = 0,
        NoMatchingSubscribers = 16,
        UnspecifiedError = 128,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        TopicNameInvalid = 144,
        PacketIdentifierInUse = 145,
        QuotaExceeded = 151,
        PayloadFormatInvalid = 153
    }
}

impl PublishAckReason {
    /// Reason codes of 0x80 and above report a failed delivery.
    #[inline]
    pub fn is_error(&self) -> bool {
        u8::from(*self) >= 0x80
    }
}

prim_enum! {
    /// PUBREL / PUBCOMP reason codes
    #[derive(Deserialize, Serialize)]
    pub enum PublishAck2Reason {
        Success = 0,
        PacketIdNotFound = 146
    }
}

impl PublishAck2Reason {
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, PublishAck2Reason::PacketIdNotFound)
    }
}

impl PublishAck {
    pub fn new(packet_id: NonZeroU16, reason_code: PublishAckReason) -> Self {
        Self { packet_id, reason_code, properties: UserProperties::default(), reason_string: None }
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;

        let ack = if src.has_remaining() {
            let reason_code = src.get_u8().try_into()?;
            if src.has_remaining() {
                let (properties, reason_string) = ack_props::decode(src)?;
                ensure!(!src.has_remaining(), DecodeError::InvalidLength); // no data should be left in src
                Self { packet_id, reason_code, properties, reason_string }
            } else {
                Self::new(packet_id, reason_code)
            }
        } else {
            Self::new(packet_id, PublishAckReason::Success)
        };

        Ok(ack)
    }
}

impl PublishAck2 {
    pub fn new(packet_id: NonZeroU16, reason_code: PublishAck2Reason) -> Self {
        Self { packet_id, reason_code, properties: UserProperties::default(), reason_string: None }
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;
        let ack = if src.has_remaining() {
            let reason_code = src.get_u8().try_into()?;
            if src.has_remaining() {
                let (properties, reason_string) = ack_props::decode(src)?;
                ensure!(!src.has_remaining(), DecodeError::InvalidLength);
                Self { packet_id, reason_code, properties, reason_string }
            } else {
                Self::new(packet_id, reason_code)
            }
        } else {
            Self::new(packet_id, PublishAck2Reason::Success)
        };

        Ok(ack)
    }
}

impl EncodeLtd for PublishAck {
    fn encoded_size(&self, omit: Omit) -> usize {
        ack_props::encoded_size(
            self.reason_code == PublishAckReason::Success,
            &self.properties,
            &self.reason_string,
            omit,
        )
    }

    fn encode(&self, buf: &mut BytesMut, size: u32, omit: Omit) -> Result<(), EncodeError> {
        ack_props::encode(
            self.packet_id,
            self.reason_code.into(),
            &self.properties,
            &self.reason_string,
            buf,
            size,
            omit,
        )
    }
}

impl EncodeLtd for PublishAck2 {
    fn encoded_size(&self, omit: Omit) -> usize {
        ack_props::encoded_size(
            self.reason_code == PublishAck2Reason::Success,
            &self.properties,
            &self.reason_string,
            omit,
        )
    }

    fn encode(&self, buf: &mut BytesMut, size: u32, omit: Omit) -> Result<(), EncodeError> {
        ack_props::encode(
            self.packet_id,
            self.reason_code.into(),
            &self.properties,
            &self.reason_string,
            buf,
            size,
            omit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn encode(ack: &PublishAck, omit: Omit) -> BytesMut {
        let mut buf = BytesMut::new();
        let size = ack.encoded_size(omit);
        ack.encode(&mut buf, size as u32, omit).unwrap();
        assert_eq!(buf.len(), size);
        buf
    }

    #[test_case(b"\xFF\xFF\x00\x00", 65535, PublishAckReason::Success, vec![], None; "success_empty")]
    #[test_case(b"\x00\x01", 1, PublishAckReason::Success, vec![], None; "success_no_reason")]
    #[test_case(b"\x01\x01\x00", 257, PublishAckReason::Success, vec![], None; "success_no_prop_len")]
    #[test_case(b"\x00\x01\x87", 1, PublishAckReason::NotAuthorized, vec![], None; "no_success_no_prop_len")]
    #[test_case(b"\x00\x01\x83\x00", 1, PublishAckReason::ImplementationSpecificError, vec![], None; "no_success_min")]
    #[test_case(b"\x00\xFF\x80\x0D\x26\x00\x01a\x00\x01b\x1F\x00\x03123", 255, PublishAckReason::UnspecifiedError, vec![("a", "b")], Some("123"); "all_out")]
    fn puback_decode_success(
        input: &'static [u8],
        packet_id: u16,
        reason_code: PublishAckReason,
        properties: Vec<(&'static str, &'static str)>,
        reason_string: Option<&'static str>,
    ) {
        let mut input = input.into();
        let result = PublishAck::decode(&mut input);
        assert_eq!(
            result.unwrap(),
            PublishAck {
                packet_id: packet_id.try_into().unwrap(),
                reason_code,
                properties: properties.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
                reason_string: reason_string.map(|s| s.into())
            }
        );
        assert_eq!(input.len(), 0);
    }

    #[test_case(b"\x00\x00"; "packet_id_zero")]
    #[test_case(b"\x00\x01\x05"; "unknown_reason")]
    #[test_case(b"\x00\x01\x00\x03\x02\x00\x00\x00\x01"; "illegal_property")]
    fn puback_decode_malformed(input: &'static [u8]) {
        let mut input = input.into();
        assert!(matches!(PublishAck::decode(&mut input), Err(DecodeError::MalformedPacket(_))));
    }

    #[test]
    fn puback_decode_properties_promised() {
        let mut input = Bytes::from_static(b"\x00\x01\x00\x01");
        assert!(matches!(PublishAck::decode(&mut input), Err(DecodeError::InvalidLength)));
    }

    #[test]
    fn puback_success_omits_reason_and_properties() {
        let ack = PublishAck::new(NonZeroU16::new(1).unwrap(), PublishAckReason::Success);
        assert_eq!(&encode(&ack, Omit::Nothing)[..], b"\x00\x01");
    }

    #[test]
    fn puback_error_omits_property_length() {
        let ack = PublishAck::new(NonZeroU16::new(0x0102).unwrap(), PublishAckReason::QuotaExceeded);
        assert_eq!(&encode(&ack, Omit::Nothing)[..], b"\x01\x02\x97");
    }

    #[test]
    fn puback_trimming_levels() {
        let ack = PublishAck {
            packet_id: NonZeroU16::new(1).unwrap(),
            reason_code: PublishAckReason::UnspecifiedError,
            properties: vec![("a".into(), "b".into())],
            reason_string: Some("123".into()),
        };
        assert_eq!(&encode(&ack, Omit::Nothing)[..], b"\x00\x01\x80\x0D\x26\x00\x01a\x00\x01b\x1F\x00\x03123");
        assert_eq!(&encode(&ack, Omit::UserProperties)[..], b"\x00\x01\x80\x06\x1F\x00\x03123");
        assert_eq!(&encode(&ack, Omit::ReasonString)[..], b"\x00\x01\x80");

        let ack = PublishAck { reason_code: PublishAckReason::Success, ..ack };
        assert_eq!(&encode(&ack, Omit::ReasonString)[..], b"\x00\x01");
    }

    #[test]
    fn pubrel_decode() {
        let mut input = Bytes::from_static(b"\x00\x07\x92");
        let rel = PublishAck2::decode(&mut input).unwrap();
        assert_eq!(rel, PublishAck2::new(NonZeroU16::new(7).unwrap(), PublishAck2Reason::PacketIdNotFound));
        assert!(rel.reason_code.is_error());
    }
}
