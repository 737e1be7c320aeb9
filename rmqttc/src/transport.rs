//! Byte stream contract and the framed MQTT stream on top of it.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use rmqttc_codec::error::EncodeError;
use rmqttc_codec::{compat, v3, v5, MqttCodec, MqttPacket};

use crate::error::{MqttError, Result};

/// Ordered, reliable byte stream to the server.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens byte streams; TLS, WebSocket or proxies live behind this seam.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, server: &str) -> io::Result<Box<dyn Io>>;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, server: &str) -> io::Result<Box<dyn Io>> {
        let stream = TcpStream::connect(server).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Framed MQTT stream that speaks the v5 packet model whatever the wire version is.
pub(crate) struct MqttStream {
    io: Framed<Box<dyn Io>, MqttCodec>,
}

impl MqttStream {
    pub(crate) fn new(io: Box<dyn Io>, v5: bool, max_inbound_size: u32) -> Self {
        let codec = if v5 {
            MqttCodec::V5(v5::Codec::new(max_inbound_size, 0))
        } else {
            MqttCodec::V3(v3::Codec::new(max_inbound_size))
        };
        MqttStream { io: Framed::new(io, codec) }
    }

    #[inline]
    pub(crate) fn is_v5(&self) -> bool {
        self.io.codec().is_v5()
    }

    /// Applies the Maximum Packet Size granted in CONNACK to outbound packets.
    #[inline]
    pub(crate) fn set_max_outbound_size(&mut self, size: u32) {
        self.io.codec_mut().set_max_outbound_size(size);
    }

    /// Writes and flushes one packet.
    ///
    /// Encode failures leave the stream usable and come back as [`MqttError::Encode`].
    pub(crate) async fn send(&mut self, packet: v5::Packet) -> Result<()> {
        let packet = if self.is_v5() { MqttPacket::V5(packet) } else { MqttPacket::V3(compat::to_v3(packet)?) };
        self.io.send(packet).await.map_err(|e| match e {
            EncodeError::Io(e) => MqttError::Io(e),
            e => MqttError::Encode(e),
        })
    }

    /// Next packet, `None` once the server closed the stream.
    pub(crate) async fn recv(&mut self) -> Option<Result<v5::Packet>> {
        Some(match self.io.next().await? {
            Ok((MqttPacket::V5(packet), _)) => Ok(packet),
            Ok((MqttPacket::V3(packet), _)) => Ok(compat::from_v3(packet)),
            Err(e) => Err(MqttError::from(e)),
        })
    }

    pub(crate) async fn close(&mut self, tm: Duration) -> Result<()> {
        match tokio::time::timeout(tm, self.io.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::from(e)),
            Err(_) => Err(MqttError::Timeout),
        }
    }
}
