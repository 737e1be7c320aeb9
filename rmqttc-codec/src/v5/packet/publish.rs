use std::{num::NonZeroU16, num::NonZeroU32};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::types::{Publish, QoS};
use crate::utils::{self, write_variable_length, Decode, Encode, Property};
use crate::v5::{encode::*, property_type as pt, UserProperties};

#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct PublishProperties {
    /// Kept as read from the wire; 0 is illegal and left to the receiver's alias table
    pub topic_alias: Option<u16>,
    pub correlation_data: Option<Bytes>,
    pub message_expiry_interval: Option<NonZeroU32>,
    pub content_type: Option<ByteString>,
    pub user_properties: UserProperties,
    pub is_utf8_payload: bool,
    pub response_topic: Option<ByteString>,
    pub subscription_ids: Vec<NonZeroU32>,
}

impl Publish {
    pub(crate) fn decode(mut src: Bytes, packet_flags: u8) -> Result<Self, DecodeError> {
        let topic = ByteString::decode(&mut src)?;
        let qos = QoS::try_from((packet_flags & 0b0110) >> 1)?;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(NonZeroU16::decode(&mut src)?) // packet id = 0 encountered
        };

        let properties = parse_publish_properties(&mut src)?;
        let payload = src;

        Ok(Self {
            dup: (packet_flags & 0b1000) == 0b1000,
            qos,
            retain: (packet_flags & 0b0001) == 0b0001,
            topic,
            packet_id,
            payload,
            properties: Some(properties),
        })
    }
}

impl std::convert::From<UserProperties> for PublishProperties {
    fn from(props: UserProperties) -> Self {
        PublishProperties { user_properties: props, ..Default::default() }
    }
}

fn parse_publish_properties(src: &mut Bytes) -> Result<PublishProperties, DecodeError> {
    let prop_src = &mut utils::take_properties(src)?;

    let mut message_expiry_interval = None;
    let mut topic_alias = None;
    let mut content_type = None;
    let mut correlation_data = None;
    let mut subscription_ids = Vec::new();
    let mut response_topic = None;
    let mut is_utf8_payload = None;
    let mut user_props = Vec::new();

    while prop_src.has_remaining() {
        match prop_src.get_u8() {
            pt::UTF8_PAYLOAD => is_utf8_payload.read_value(prop_src)?,
            pt::MSG_EXPIRY_INT => message_expiry_interval.read_value(prop_src)?,
            pt::CONTENT_TYPE => content_type.read_value(prop_src)?,
            pt::RESP_TOPIC => response_topic.read_value(prop_src)?,
            pt::CORR_DATA => correlation_data.read_value(prop_src)?,
            pt::SUB_ID => {
                let id = utils::decode_variable_length_cursor(prop_src)?;
                subscription_ids
                    .push(NonZeroU32::new(id).ok_or(DecodeError::MalformedPacket("subscription id is zero"))?);
            }
            pt::TOPIC_ALIAS => topic_alias.read_value(prop_src)?,
            pt::USER => user_props.push(<(ByteString, ByteString)>::decode(prop_src)?),
            _ => return Err(DecodeError::MalformedPacket("unexpected publish property")),
        }
    }

    Ok(PublishProperties {
        message_expiry_interval,
        topic_alias,
        content_type,
        correlation_data,
        subscription_ids,
        response_topic,
        is_utf8_payload: is_utf8_payload.unwrap_or(false),
        user_properties: user_props,
    })
}

impl EncodeLtd for Publish {
    fn encoded_size(&self, omit: Omit) -> usize {
        let packet_id_size = if self.qos == QoS::AtMostOnce { 0 } else { 2 };
        let prop_len = self.properties.as_ref().map(|p| p.encoded_size(omit)).unwrap_or(0);
        self.topic.encoded_size() + packet_id_size + props_block_size(prop_len) + self.payload.len()
    }

    fn encode(&self, buf: &mut BytesMut, _size: u32, omit: Omit) -> Result<(), EncodeError> {
        self.topic.encode(buf)?;
        if self.qos == QoS::AtMostOnce {
            if self.packet_id.is_some() {
                return Err(EncodeError::MalformedPacket); // packet id must not be set
            }
        } else {
            self.packet_id.ok_or(EncodeError::PacketIdRequired)?.encode(buf)?;
        }
        match &self.properties {
            Some(prop) => prop.encode(buf, omit)?,
            None => buf.put_u8(0),
        }
        buf.put(self.payload.as_ref());
        Ok(())
    }
}

impl PublishProperties {
    /// Size of the property list without its length prefix.
    fn encoded_size(&self, omit: Omit) -> usize {
        encoded_property_size(&self.topic_alias)
            + encoded_property_size(&self.correlation_data)
            + encoded_property_size(&self.message_expiry_interval)
            + encoded_property_size(&self.content_type)
            + encoded_property_size_default(&self.is_utf8_payload, false)
            + encoded_property_size(&self.response_topic)
            + self.subscription_ids.iter().fold(0, |acc, id| acc + 1 + var_int_len(id.get() as usize) as usize)
            + encoded_user_props_size(&self.user_properties, omit)
    }

    fn encode(&self, buf: &mut BytesMut, omit: Omit) -> Result<(), EncodeError> {
        write_props_len(self.encoded_size(omit), buf)?;
        encode_property(&self.topic_alias, pt::TOPIC_ALIAS, buf)?;
        encode_property(&self.correlation_data, pt::CORR_DATA, buf)?;
        encode_property(&self.message_expiry_interval, pt::MSG_EXPIRY_INT, buf)?;
        encode_property(&self.content_type, pt::CONTENT_TYPE, buf)?;
        encode_property_default(&self.is_utf8_payload, false, pt::UTF8_PAYLOAD, buf)?;
        encode_property(&self.response_topic, pt::RESP_TOPIC, buf)?;
        for sub_id in self.subscription_ids.iter() {
            buf.put_u8(pt::SUB_ID);
            write_variable_length(sub_id.get(), buf)?;
        }
        encode_user_props(&self.user_properties, buf, omit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_with_alias_and_empty_topic() {
        let src = Bytes::from_static(b"\x00\x00\x00\x07\x03\x23\x00\x05data");
        let publish = Publish::decode(src, 0b0010).unwrap();
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.packet_id, NonZeroU16::new(7));
        assert!(publish.topic.is_empty());
        assert_eq!(publish.topic_alias(), Some(5));
        assert_eq!(publish.payload, Bytes::from_static(b"data"));
    }

    #[test]
    fn publish_drops_user_properties_when_omitted() {
        let publish = Publish {
            properties: Some(PublishProperties {
                user_properties: vec![("k".into(), "v".into())],
                ..Default::default()
            }),
            ..Publish::new("t", Bytes::from_static(b"p"), QoS::AtMostOnce, false)
        };
        let full = publish.encoded_size(Omit::Nothing);
        let trimmed = publish.encoded_size(Omit::UserProperties);
        assert_eq!(full - trimmed, 7);

        let mut buf = BytesMut::new();
        publish.encode(&mut buf, trimmed as u32, Omit::UserProperties).unwrap();
        assert_eq!(&buf[..], b"\x00\x01t\x00p");
    }

    #[test]
    fn publish_qos0_with_packet_id_is_rejected() {
        let mut publish = Publish::new("t", Bytes::new(), QoS::AtMostOnce, false);
        publish.packet_id = NonZeroU16::new(1);
        let mut buf = BytesMut::new();
        assert!(matches!(publish.encode(&mut buf, 4, Omit::Nothing), Err(EncodeError::MalformedPacket)));

        let publish = Publish::new("t", Bytes::new(), QoS::ExactlyOnce, false);
        assert!(matches!(publish.encode(&mut buf, 6, Omit::Nothing), Err(EncodeError::PacketIdRequired)));
    }
}
