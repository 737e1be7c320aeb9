use std::num::{NonZeroU16, NonZeroU32};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use super::ack_props;
use crate::error::{DecodeError, EncodeError};
use crate::types::QoS;
use crate::utils::{self, write_variable_length, Decode, Encode};
use crate::v5::{encode::*, property_type as pt, UserProperties, UserProperty};

/// SUBSCRIBE, at least one filter
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Subscribe {
    pub packet_id: NonZeroU16,
    /// Subscription Identifier property
    pub id: Option<NonZeroU32>,
    pub user_properties: UserProperties,
    pub topic_filters: Vec<(ByteString, SubscriptionOptions)>,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::AtSubscribe,
        }
    }
}

prim_enum! {
    pub enum RetainHandling {
        AtSubscribe = 0,
        AtSubscribeNew = 1,
        NoAtSubscribe = 2
    }
}

/// SUBACK, one reason code per filter of the matching SUBSCRIBE
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SubscribeAck {
    pub packet_id: NonZeroU16,
    pub properties: UserProperties,
    pub reason_string: Option<ByteString>,
    pub status: Vec<SubscribeAckReason>,
}

/// UNSUBSCRIBE
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Unsubscribe {
    pub packet_id: NonZeroU16,
    pub user_properties: UserProperties,
    pub topic_filters: Vec<ByteString>,
}

/// UNSUBACK, reason codes are empty when decoded from v3.1.1
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct UnsubscribeAck {
    pub packet_id: NonZeroU16,
    pub properties: UserProperties,
    pub reason_string: Option<ByteString>,
    pub status: Vec<UnsubscribeAckReason>,
}

prim_enum! {
    /// Granted QoS or failure of one filter
    #[derive(Deserialize, Serialize)]
    pub enum SubscribeAckReason {
        GrantedQos0 = 0,
        GrantedQos1 = 1,
        GrantedQos2 = 2,
        UnspecifiedError = 128,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        TopicFilterInvalid = 143,
        PacketIdentifierInUse = 145,
        QuotaExceeded = 151,
        SharedSubscriptionNotSupported = 158,
        SubscriptionIdentifiersNotSupported = 161,
        WildcardSubscriptionsNotSupported = 162
    }
}

impl SubscribeAckReason {
    #[inline]
    pub fn is_error(&self) -> bool {
        u8::from(*self) >= 0x80
    }

    /// QoS granted by the server, `None` for a failure code.
    pub fn granted_qos(&self) -> Option<QoS> {
        match self {
            SubscribeAckReason::GrantedQos0 => Some(QoS::AtMostOnce),
            SubscribeAckReason::GrantedQos1 => Some(QoS::AtLeastOnce),
            SubscribeAckReason::GrantedQos2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

prim_enum! {
    #[derive(Deserialize, Serialize)]
    pub enum UnsubscribeAckReason {
        Success = 0,
        NoSubscriptionExisted = 17,
        UnspecifiedError = 128,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        TopicFilterInvalid = 143,
        PacketIdentifierInUse = 145
    }
}

impl UnsubscribeAckReason {
    #[inline]
    pub fn is_error(&self) -> bool {
        u8::from(*self) >= 0x80
    }
}

impl Subscribe {
    pub fn new(packet_id: NonZeroU16, topic_filters: Vec<(ByteString, SubscriptionOptions)>) -> Self {
        Self { packet_id, id: None, user_properties: UserProperties::default(), topic_filters }
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;
        let prop_src = &mut utils::take_properties(src)?;
        let mut sub_id = None;
        let mut user_properties = Vec::new();
        while prop_src.has_remaining() {
            let prop_id = prop_src.get_u8();
            match prop_id {
                pt::SUB_ID => {
                    ensure!(sub_id.is_none(), DecodeError::MalformedPacket("property is set twice"));
                    let val = utils::decode_variable_length_cursor(prop_src)?;
                    sub_id = Some(NonZeroU32::new(val).ok_or(DecodeError::MalformedPacket("subscription id is zero"))?);
                }
                pt::USER => user_properties.push(UserProperty::decode(prop_src)?),
                _ => return Err(DecodeError::MalformedPacket("unexpected subscribe property")),
            }
        }

        let mut topic_filters = Vec::new();
        while src.has_remaining() {
            let topic = ByteString::decode(src)?;
            let opts = SubscriptionOptions::decode(src)?;
            topic_filters.push((topic, opts));
        }

        Ok(Self { packet_id, id: sub_id, user_properties, topic_filters })
    }
}

impl SubscribeAck {
    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;
        let (properties, reason_string) = ack_props::decode(src)?;
        let mut status = Vec::with_capacity(src.remaining());
        for code in src.as_ref().iter().copied() {
            status.push(code.try_into()?);
        }
        Ok(Self { packet_id, properties, reason_string, status })
    }
}

impl Unsubscribe {
    pub fn new(packet_id: NonZeroU16, topic_filters: Vec<ByteString>) -> Self {
        Self { packet_id, user_properties: UserProperties::default(), topic_filters }
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;

        let prop_src = &mut utils::take_properties(src)?;
        let mut user_properties = Vec::new();
        while prop_src.has_remaining() {
            let prop_id = prop_src.get_u8();
            match prop_id {
                pt::USER => user_properties.push(UserProperty::decode(prop_src)?),
                _ => return Err(DecodeError::MalformedPacket("unexpected unsubscribe property")),
            }
        }

        let mut topic_filters = Vec::new();
        while src.remaining() > 0 {
            topic_filters.push(ByteString::decode(src)?);
        }

        Ok(Self { packet_id, user_properties, topic_filters })
    }
}

impl UnsubscribeAck {
    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let packet_id = NonZeroU16::decode(src)?;
        let (properties, reason_string) = ack_props::decode(src)?;
        let mut status = Vec::with_capacity(src.remaining());
        for code in src.as_ref().iter().copied() {
            status.push(code.try_into()?);
        }
        Ok(Self { packet_id, properties, reason_string, status })
    }
}

impl Subscribe {
    fn properties_len(&self, omit: Omit) -> usize {
        self.id.map_or(0, |v| 1 + var_int_len(v.get() as usize) as usize) // +1 to account for property type byte
            + encoded_user_props_size(&self.user_properties, omit)
    }
}

impl EncodeLtd for Subscribe {
    fn encoded_size(&self, omit: Omit) -> usize {
        let payload_len =
            self.topic_filters.iter().fold(0, |acc, (filter, _opts)| acc + filter.encoded_size() + 1);
        self.packet_id.encoded_size() + props_block_size(self.properties_len(omit)) + payload_len
    }

    fn encode(&self, buf: &mut BytesMut, _: u32, omit: Omit) -> Result<(), EncodeError> {
        self.packet_id.encode(buf)?;

        write_props_len(self.properties_len(omit), buf)?;
        if let Some(id) = self.id {
            buf.put_u8(pt::SUB_ID);
            write_variable_length(id.get(), buf)?;
        }
        encode_user_props(&self.user_properties, buf, omit)?;

        // payload
        for (filter, opts) in self.topic_filters.iter() {
            filter.encode(buf)?;
            opts.encode(buf)?;
        }

        Ok(())
    }
}

impl Decode for SubscriptionOptions {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.has_remaining(), DecodeError::InvalidLength);
        let val = src.get_u8();
        let qos = (val & 0b0000_0011).try_into()?;
        let retain_handling = ((val & 0b0011_0000) >> 4).try_into()?;
        Ok(SubscriptionOptions {
            qos,
            no_local: val & 0b0000_0100 != 0,
            retain_as_published: val & 0b0000_1000 != 0,
            retain_handling,
        })
    }
}

impl Encode for SubscriptionOptions {
    fn encoded_size(&self) -> usize {
        1
    }
    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(
            u8::from(self.qos)
                | ((self.no_local as u8) << 2)
                | ((self.retain_as_published as u8) << 3)
                | (u8::from(self.retain_handling) << 4),
        );
        Ok(())
    }
}

impl EncodeLtd for SubscribeAck {
    fn encoded_size(&self, omit: Omit) -> usize {
        2 + props_block_size(encoded_size_opt_props(&self.properties, &self.reason_string, omit)) + self.status.len()
    }

    fn encode(&self, buf: &mut BytesMut, _size: u32, omit: Omit) -> Result<(), EncodeError> {
        self.packet_id.encode(buf)?;
        write_props_len(encoded_size_opt_props(&self.properties, &self.reason_string, omit), buf)?;
        encode_opt_props(&self.properties, &self.reason_string, buf, omit)?;
        for &reason in self.status.iter() {
            buf.put_u8(reason.into());
        }
        Ok(())
    }
}

impl EncodeLtd for Unsubscribe {
    fn encoded_size(&self, omit: Omit) -> usize {
        2 + props_block_size(encoded_user_props_size(&self.user_properties, omit))
            + self.topic_filters.iter().fold(0, |acc, filter| acc + 2 + filter.len())
    }

    fn encode(&self, buf: &mut BytesMut, _size: u32, omit: Omit) -> Result<(), EncodeError> {
        self.packet_id.encode(buf)?;

        write_props_len(encoded_user_props_size(&self.user_properties, omit), buf)?;
        encode_user_props(&self.user_properties, buf, omit)?;

        // payload
        for filter in self.topic_filters.iter() {
            filter.encode(buf)?;
        }
        Ok(())
    }
}

impl EncodeLtd for UnsubscribeAck {
    fn encoded_size(&self, omit: Omit) -> usize {
        2 + props_block_size(encoded_size_opt_props(&self.properties, &self.reason_string, omit)) + self.status.len()
    }

    fn encode(&self, buf: &mut BytesMut, _size: u32, omit: Omit) -> Result<(), EncodeError> {
        self.packet_id.encode(buf)?;
        write_props_len(encoded_size_opt_props(&self.properties, &self.reason_string, omit), buf)?;
        encode_opt_props(&self.properties, &self.reason_string, buf, omit)?;
        for &reason in self.status.iter() {
            buf.put_u8(reason.into());
        }
        Ok(())
    }
}
