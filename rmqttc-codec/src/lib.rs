#![deny(unsafe_code)]

//! MQTT v5.0 and v3.1.1 packet codec used by the `rmqttc` client.
//!
//! Packets are modelled after MQTT v5; [`compat`] converts them for v3.1.1 connections.
//! Outbound v5 packets are trimmed to the peer's Maximum Packet Size by dropping user
//! properties first and the reason string second.

#[macro_use]
mod utils;

pub mod compat;
pub mod error;
pub mod types;
pub mod v3;
pub mod v5;

pub use utils::MAX_VARIABLE_LENGTH;

/// Codec for the protocol version negotiated by CONNECT.
#[derive(Debug)]
pub enum MqttCodec {
    V3(v3::Codec),
    V5(v5::Codec),
}

/// Packet of either protocol version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttPacket {
    V3(v3::Packet),
    V5(v5::Packet),
}

impl MqttCodec {
    #[inline]
    pub fn is_v5(&self) -> bool {
        matches!(self, MqttCodec::V5(_))
    }

    /// Applies the Maximum Packet Size granted by the server; v3.1.1 has none.
    pub fn set_max_outbound_size(&mut self, size: u32) {
        if let MqttCodec::V5(codec) = self {
            codec.set_max_outbound_size(size);
        }
    }
}

impl tokio_util::codec::Encoder<MqttPacket> for MqttCodec {
    type Error = error::EncodeError;

    /// # Example
    /// ```
    /// use bytes::BytesMut;
    /// use rmqttc_codec::{MqttCodec, MqttPacket, v3};
    /// use tokio_util::codec::Encoder;
    ///
    /// let mut codec = MqttCodec::V3(v3::Codec::new(1024 * 1024));
    /// let mut buffer = BytesMut::new();
    /// codec.encode(MqttPacket::V3(v3::Packet::PingRequest), &mut buffer).unwrap();
    /// assert_eq!(&buffer[..], b"\xc0\x00");
    /// ```
    #[inline]
    fn encode(&mut self, item: MqttPacket, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        match (self, item) {
            (MqttCodec::V3(codec), MqttPacket::V3(p)) => codec.encode(p, dst),
            (MqttCodec::V5(codec), MqttPacket::V5(p)) => codec.encode(p, dst),
            _ => Err(error::EncodeError::UnsupportedVersion),
        }
    }
}

impl tokio_util::codec::Decoder for MqttCodec {
    type Item = (MqttPacket, u32);
    type Error = error::DecodeError;

    /// Yields the packet together with its remaining length.
    ///
    /// # Example
    /// ```
    /// use bytes::BytesMut;
    /// use rmqttc_codec::{MqttCodec, MqttPacket, v5};
    /// use tokio_util::codec::Decoder;
    ///
    /// let mut codec = MqttCodec::V5(v5::Codec::new(0, 0));
    /// let mut buffer = BytesMut::from(&b"\xd0\x00"[..]);
    /// let (packet, _) = codec.decode(&mut buffer).unwrap().unwrap();
    /// assert_eq!(packet, MqttPacket::V5(v5::Packet::PingResponse));
    /// ```
    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let p = match self {
            MqttCodec::V3(codec) => codec.decode(src)?.map(|(p, remaining)| (MqttPacket::V3(p), remaining)),
            MqttCodec::V5(codec) => codec.decode(src)?.map(|(p, remaining)| (MqttPacket::V5(p), remaining)),
        };
        Ok(p)
    }
}
