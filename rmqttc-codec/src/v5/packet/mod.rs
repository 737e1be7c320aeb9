use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

pub use crate::types::{ConnectAckFlags, ConnectFlags, Publish, QoS};

use super::{encode::*, property_type as pt, UserProperties};
use crate::error::{DecodeError, EncodeError};
use crate::types::packet_type;
use crate::utils::{take_properties, Decode, Property};

mod auth;
mod connack;
mod connect;
mod disconnect;
mod pubacks;
mod publish;
mod subscribe;

pub use auth::*;
pub use connack::*;
pub use connect::*;
pub use disconnect::*;
pub use pubacks::*;
pub use publish::*;
pub use subscribe::*;

/// The fifteen MQTT v5 control packets; each variant carries only the fields legal for it.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(Box<ConnectAck>),
    Publish(Box<Publish>),
    PublishAck(PublishAck),
    /// PUBREC, first step of a QoS 2 flow
    PublishReceived(PublishAck),
    /// PUBREL
    PublishRelease(PublishAck2),
    /// PUBCOMP
    PublishComplete(PublishAck2),
    Subscribe(Subscribe),
    SubscribeAck(SubscribeAck),
    Unsubscribe(Unsubscribe),
    UnsubscribeAck(UnsubscribeAck),
    PingRequest,
    PingResponse,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    /// Fixed header byte without the PUBLISH flag bits.
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => packet_type::CONNECT,
            Packet::ConnectAck(_) => packet_type::CONNACK,
            Packet::Publish(_) => packet_type::PUBLISH_START,
            Packet::PublishAck(_) => packet_type::PUBACK,
            Packet::PublishReceived(_) => packet_type::PUBREC,
            Packet::PublishRelease(_) => packet_type::PUBREL,
            Packet::PublishComplete(_) => packet_type::PUBCOMP,
            Packet::Subscribe(_) => packet_type::SUBSCRIBE,
            Packet::SubscribeAck(_) => packet_type::SUBACK,
            Packet::Unsubscribe(_) => packet_type::UNSUBSCRIBE,
            Packet::UnsubscribeAck(_) => packet_type::UNSUBACK,
            Packet::PingRequest => packet_type::PINGREQ,
            Packet::PingResponse => packet_type::PINGRESP,
            Packet::Disconnect(_) => packet_type::DISCONNECT,
            Packet::Auth(_) => packet_type::AUTH,
        }
    }
}

macro_rules! into_packet {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Packet {
                fn from(pkt: $ty) -> Self {
                    Self::$variant(pkt.into())
                }
            }
        )*
    };
}

into_packet! {
    Connect => Connect,
    Box<Connect> => Connect,
    ConnectAck => ConnectAck,
    Box<ConnectAck> => ConnectAck,
    Publish => Publish,
    PublishAck => PublishAck,
    Subscribe => Subscribe,
    SubscribeAck => SubscribeAck,
    Unsubscribe => Unsubscribe,
    UnsubscribeAck => UnsubscribeAck,
    Disconnect => Disconnect,
    Auth => Auth,
}

pub(super) mod property_type {
    pub(crate) const UTF8_PAYLOAD: u8 = 0x01;
    pub(crate) const MSG_EXPIRY_INT: u8 = 0x02;
    pub(crate) const CONTENT_TYPE: u8 = 0x03;
    pub(crate) const RESP_TOPIC: u8 = 0x08;
    pub(crate) const CORR_DATA: u8 = 0x09;
    pub(crate) const SUB_ID: u8 = 0x0B;
    pub(crate) const SESS_EXPIRY_INT: u8 = 0x11;
    pub(crate) const ASSND_CLIENT_ID: u8 = 0x12;
    pub(crate) const SERVER_KA: u8 = 0x13;
    pub(crate) const AUTH_METHOD: u8 = 0x15;
    pub(crate) const AUTH_DATA: u8 = 0x16;
    pub(crate) const REQ_PROB_INFO: u8 = 0x17;
    pub(crate) const WILL_DELAY_INT: u8 = 0x18;
    pub(crate) const REQ_RESP_INFO: u8 = 0x19;
    pub(crate) const RESP_INFO: u8 = 0x1A;
    pub(crate) const SERVER_REF: u8 = 0x1C;
    pub(crate) const REASON_STRING: u8 = 0x1F;
    pub(crate) const RECEIVE_MAX: u8 = 0x21;
    pub(crate) const TOPIC_ALIAS_MAX: u8 = 0x22;
    pub(crate) const TOPIC_ALIAS: u8 = 0x23;
    pub(crate) const MAX_QOS: u8 = 0x24;
    pub(crate) const RETAIN_AVAIL: u8 = 0x25;
    pub(crate) const USER: u8 = 0x26;
    pub(crate) const MAX_PACKET_SIZE: u8 = 0x27;
    pub(crate) const WILDCARD_SUB_AVAIL: u8 = 0x28;
    pub(crate) const SUB_IDS_AVAIL: u8 = 0x29;
    pub(crate) const SHARED_SUB_AVAIL: u8 = 0x2A;
}

mod ack_props {
    use std::num::NonZeroU16;

    use super::*;
    use crate::v5::UserProperty;

    /// Remaining length of PUBACK/PUBREC/PUBREL/PUBCOMP.
    ///
    /// A successful ack without properties is just the packet id, an ack without
    /// properties drops the property length.
    pub(crate) fn encoded_size(
        success: bool,
        properties: &[UserProperty],
        reason_string: &Option<ByteString>,
        omit: Omit,
    ) -> usize {
        let prop_len = encoded_size_opt_props(properties, reason_string, omit);
        match (prop_len, success) {
            (0, true) => 2,
            (0, false) => 3,
            _ => 3 + props_block_size(prop_len),
        }
    }

    pub(crate) fn encode(
        packet_id: NonZeroU16,
        reason_code: u8,
        properties: &[UserProperty],
        reason_string: &Option<ByteString>,
        buf: &mut BytesMut,
        size: u32,
        omit: Omit,
    ) -> Result<(), EncodeError> {
        buf.put_u16(packet_id.get());
        if size > 2 {
            buf.put_u8(reason_code);
        }
        if size > 3 {
            write_props_len(encoded_size_opt_props(properties, reason_string, omit), buf)?;
            encode_opt_props(properties, reason_string, buf, omit)?;
        }
        Ok(())
    }

    /// Parses ACK properties (User and Reason String properties) from `src`
    pub(crate) fn decode(src: &mut Bytes) -> Result<(UserProperties, Option<ByteString>), DecodeError> {
        let prop_src = &mut take_properties(src)?;
        let mut reason_string = None;
        let mut user_props = Vec::new();
        while prop_src.has_remaining() {
            let prop_id = prop_src.get_u8();
            match prop_id {
                pt::REASON_STRING => reason_string.read_value(prop_src)?,
                pt::USER => user_props.push(<(ByteString, ByteString)>::decode(prop_src)?),
                _ => return Err(DecodeError::MalformedPacket("unexpected ack property")),
            }
        }

        Ok((user_props, reason_string))
    }
}
