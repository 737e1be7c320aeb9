//! MQTT v3.1.1 protocol codec

#[allow(clippy::module_inception)]
mod codec;
mod decode;
mod encode;
mod packet;

pub use self::codec::Codec;
pub use self::packet::{Connect, ConnectAck, ConnectAckReason, LastWill, Packet, Publish, SubscribeReturnCode};
pub use crate::types::{ConnectAckFlags, ConnectFlags, QoS};
