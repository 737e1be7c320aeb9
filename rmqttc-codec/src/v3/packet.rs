use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::types::{packet_type, Protocol, QoS};

pub use crate::types::Publish;

prim_enum! {
    /// CONNACK return code
    #[derive(Deserialize, Serialize)]
    pub enum ConnectAckReason {
        ConnectionAccepted = 0,
        UnacceptableProtocolVersion = 1,
        IdentifierRejected = 2,
        ServiceUnavailable = 3,
        BadUserNameOrPassword = 4,
        NotAuthorized = 5
    }
}

impl ConnectAckReason {
    #[inline]
    pub fn is_accepted(self) -> bool {
        self == ConnectAckReason::ConnectionAccepted
    }

    pub fn reason(self) -> &'static str {
        match self {
            ConnectAckReason::ConnectionAccepted => "Connection Accepted",
            ConnectAckReason::UnacceptableProtocolVersion => {
                "Connection Refused, unacceptable protocol version"
            }
            ConnectAckReason::IdentifierRejected => "Connection Refused, identifier rejected",
            ConnectAckReason::ServiceUnavailable => "Connection Refused, Server unavailable",
            ConnectAckReason::BadUserNameOrPassword => "Connection Refused, bad user name or password",
            ConnectAckReason::NotAuthorized => "Connection Refused, not authorized",
        }
    }
}

/// Will message carried by CONNECT
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: ByteString,
    pub message: Bytes,
}

/// CONNECT content for protocol levels 3 and 4
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Connect {
    pub protocol: Protocol,
    /// discard any previous session and start a new one
    pub clean_session: bool,
    /// seconds, `0` turns keep alive off
    pub keep_alive: u16,
    pub last_will: Option<LastWill>,
    pub client_id: ByteString,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn client_id<T>(mut self, client_id: T) -> Self
    where
        ByteString: From<T>,
    {
        self.client_id = client_id.into();
        self
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
pub struct ConnectAck {
    pub return_code: ConnectAckReason,
    pub session_present: bool,
}

/// Per-filter SUBACK result
#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub(crate) const FAILURE: u8 = 0x80;

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, SubscribeReturnCode::Failure)
    }
}

impl From<SubscribeReturnCode> for u8 {
    fn from(code: SubscribeReturnCode) -> u8 {
        match code {
            SubscribeReturnCode::Success(qos) => qos.into(),
            SubscribeReturnCode::Failure => SubscribeReturnCode::FAILURE,
        }
    }
}

/// MQTT v3.1.1 control packets
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(ConnectAck),
    Publish(Publish),
    PublishAck { packet_id: NonZeroU16 },
    PublishReceived { packet_id: NonZeroU16 },
    PublishRelease { packet_id: NonZeroU16 },
    PublishComplete { packet_id: NonZeroU16 },
    Subscribe { packet_id: NonZeroU16, topic_filters: Vec<(ByteString, QoS)> },
    SubscribeAck { packet_id: NonZeroU16, status: Vec<SubscribeReturnCode> },
    Unsubscribe { packet_id: NonZeroU16, topic_filters: Vec<ByteString> },
    UnsubscribeAck { packet_id: NonZeroU16 },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}

impl Packet {
    /// First byte of the fixed header, publish flags included.
    pub fn first_byte(&self) -> u8 {
        match self {
            Packet::Connect(_) => packet_type::CONNECT,
            Packet::ConnectAck(_) => packet_type::CONNACK,
            Packet::Publish(p) => {
                packet_type::PUBLISH_START | (u8::from(p.qos) << 1) | ((p.dup as u8) << 3) | (p.retain as u8)
            }
            Packet::PublishAck { .. } => packet_type::PUBACK,
            Packet::PublishReceived { .. } => packet_type::PUBREC,
            Packet::PublishRelease { .. } => packet_type::PUBREL,
            Packet::PublishComplete { .. } => packet_type::PUBCOMP,
            Packet::Subscribe { .. } => packet_type::SUBSCRIBE,
            Packet::SubscribeAck { .. } => packet_type::SUBACK,
            Packet::Unsubscribe { .. } => packet_type::UNSUBSCRIBE,
            Packet::UnsubscribeAck { .. } => packet_type::UNSUBACK,
            Packet::PingRequest => packet_type::PINGREQ,
            Packet::PingResponse => packet_type::PINGRESP,
            Packet::Disconnect => packet_type::DISCONNECT,
        }
    }
}
