use std::io;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("Invalid length")]
    InvalidLength,
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("Malformed variable byte integer")]
    MalformedVariableInteger,
    #[error("Unsupported protocol level")]
    UnsupportedProtocolLevel,
    #[error("ConnectAck frame's reserved flag is set")]
    ConnAckReservedFlagSet,
    #[error("Unsupported packet type")]
    UnsupportedPacketType,
    // MQTT v3 only
    #[error("Packet id is required")]
    PacketIdRequired,
    #[error("Max size exceeded")]
    MaxSizeExceeded,
    #[error("utf8 error")]
    Utf8Error,
    #[error("io error, {:?}", _0)]
    Io(io::Error),
}

impl DecodeError {
    /// Decode failures that carry the peer's fault rather than a local transport problem.
    #[inline]
    pub fn is_malformed(&self) -> bool {
        !matches!(self, DecodeError::Io(_) | DecodeError::MaxSizeExceeded)
    }
}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> DecodeError {
        DecodeError::Io(e)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Packet is bigger than peer's Maximum Packet Size")]
    MaximumPacketSizeExceeded,
    #[error("Binary data or string is longer than 65535 bytes")]
    BinaryDataExceeded,
    #[error("Value does not fit a variable byte integer")]
    VariableIntegerExceeded,
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("Packet id is required")]
    PacketIdRequired,
    #[error("Unsupported version")]
    UnsupportedVersion,
    #[error("io error, {:?}", _0)]
    Io(io::Error),
}

impl From<io::Error> for EncodeError {
    fn from(e: io::Error) -> EncodeError {
        EncodeError::Io(e)
    }
}
