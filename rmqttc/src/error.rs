use std::io;

use rmqttc_codec::error::{DecodeError, EncodeError};
use rmqttc_codec::v5::{
    ConnectAckReason, DisconnectReasonCode, PublishAck, PublishAck2, SubscribeAck, UnsubscribeAck,
};

pub type Result<T, E = MqttError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// Structurally invalid packet from the server
    #[error("malformed packet, {0}")]
    MalformedPacket(DecodeError),
    /// Well-formed packet that breaks the protocol rules
    #[error("protocol violation ({reason:?}), {message}")]
    ProtocolViolation { reason: DisconnectReasonCode, message: String },
    #[error("encode error, {0}")]
    Encode(#[from] EncodeError),
    /// SUBACK carried at least one failure reason code
    #[error("subscribe rejected, {:?}", .0.status)]
    SubscribeAck(SubscribeAck),
    #[error("unsubscribe rejected, {:?}", .0.status)]
    UnsubscribeAck(UnsubscribeAck),
    #[error("publish rejected by PUBACK, {:?}", .0.reason_code)]
    PublishAck(PublishAck),
    #[error("publish rejected by PUBREC, {:?}", .0.reason_code)]
    PublishRec(PublishAck),
    #[error("publish release failed, {:?}", .0.reason_code)]
    PublishComp(PublishAck2),
    #[error("connection refused, {0:?}")]
    ConnectRefused(ConnectAckReason),
    #[error("{0} is not available on this connection")]
    NotSupported(&'static str),
    #[error("already connected")]
    AlreadyConnected,
    #[error("already connecting")]
    AlreadyConnecting,
    #[error("not connected")]
    NotConnected,
    #[error("session expired before the operation completed")]
    SessionExpired,
    #[error("keep alive timeout")]
    KeepAliveTimeout,
    #[error("timeout")]
    Timeout,
    #[error("client closed")]
    Closed,
    #[error("disconnected by server, {0:?}")]
    ServerDisconnected(DisconnectReasonCode),
    #[error("io error, {0}")]
    Io(#[from] io::Error),
}

impl MqttError {
    pub(crate) fn protocol<S: Into<String>>(message: S) -> Self {
        MqttError::ProtocolViolation { reason: DisconnectReasonCode::ProtocolError, message: message.into() }
    }

    pub(crate) fn violation<S: Into<String>>(reason: DisconnectReasonCode, message: S) -> Self {
        MqttError::ProtocolViolation { reason, message: message.into() }
    }

    /// Reason code of the DISCONNECT sent when this error closes the connection.
    pub fn to_reason_code(&self) -> DisconnectReasonCode {
        match self {
            MqttError::MalformedPacket(DecodeError::MaxSizeExceeded) => DisconnectReasonCode::PacketTooLarge,
            MqttError::MalformedPacket(_) => DisconnectReasonCode::MalformedPacket,
            MqttError::ProtocolViolation { reason, .. } => *reason,
            MqttError::Encode(EncodeError::MaximumPacketSizeExceeded) => DisconnectReasonCode::PacketTooLarge,
            MqttError::Encode(_) => DisconnectReasonCode::ImplementationSpecificError,
            MqttError::KeepAliveTimeout => DisconnectReasonCode::KeepAliveTimeout,
            MqttError::Closed => DisconnectReasonCode::NormalDisconnection,
            _ => DisconnectReasonCode::UnspecifiedError,
        }
    }

    /// Errors local to one operation, the connection stays usable.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            MqttError::Encode(_)
                | MqttError::SubscribeAck(_)
                | MqttError::UnsubscribeAck(_)
                | MqttError::PublishAck(_)
                | MqttError::PublishRec(_)
                | MqttError::PublishComp(_)
                | MqttError::NotSupported(_)
        )
    }
}

impl From<DecodeError> for MqttError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Io(e) => MqttError::Io(e),
            e => MqttError::MalformedPacket(e),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MqttError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        MqttError::Closed
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MqttError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MqttError::Closed
    }
}
