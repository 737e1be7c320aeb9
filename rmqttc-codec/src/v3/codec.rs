use std::cell::Cell;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{decode::decode_packet, Packet};
use crate::error::{DecodeError, EncodeError};
use crate::types::FixedHeader;
use crate::utils::decode_variable_length;

/// MQTT v3.1.1 codec
///
/// v3.1.1 has no Maximum Packet Size negotiation, only the inbound limit is enforced.
#[derive(Debug, Clone)]
pub struct Codec {
    state: Cell<DecodeState>,
    max_size: Cell<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DecodeState {
    FrameHeader,
    Frame(FixedHeader),
}

impl Codec {
    pub fn new(max_packet_size: u32) -> Self {
        Codec { state: Cell::new(DecodeState::FrameHeader), max_size: Cell::new(max_packet_size) }
    }

    /// Set max inbound packet size, `0` is unlimited.
    pub fn set_max_size(&mut self, size: u32) {
        self.max_size.set(size);
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for Codec {
    type Item = (Packet, u32);
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        loop {
            match self.state.get() {
                DecodeState::FrameHeader => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let first_byte = src[0];
                    let Some((remaining_length, consumed)) = decode_variable_length(&src[1..])? else {
                        return Ok(None);
                    };
                    let max_size = self.max_size.get() as usize;
                    if max_size != 0 && max_size < 1 + consumed + remaining_length as usize {
                        return Err(DecodeError::MaxSizeExceeded);
                    }
                    src.advance(consumed + 1);
                    self.state.set(DecodeState::Frame(FixedHeader { first_byte, remaining_length }));
                }
                DecodeState::Frame(fixed) => {
                    let len = fixed.remaining_length as usize;
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let packet = decode_packet(src.split_to(len).freeze(), fixed.first_byte)?;
                    self.state.set(DecodeState::FrameHeader);
                    return Ok(Some((packet, fixed.remaining_length)));
                }
            }
        }
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let size = u32::try_from(item.encoded_size()).map_err(|_| EncodeError::VariableIntegerExceeded)?;
        dst.reserve(size as usize + 5);
        item.encode(dst, size)
    }
}
