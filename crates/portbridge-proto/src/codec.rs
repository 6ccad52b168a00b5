//! Codec for encoding/decoding control messages

use crate::messages::ControlMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

/// Length of the data-channel preamble: one raw big-endian UUID.
pub const PREAMBLE_LEN: usize = 16;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Incomplete message")]
    IncompleteMessage,
}

/// Control message codec
///
/// Format: `[length: u32 BE][payload: bincode serialized message]`
pub struct ControlCodec;

impl ControlCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a control message to bytes
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a control message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: ControlMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }

    /// Try to decode multiple messages from buffer
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<ControlMessage>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }

    /// Encode the data-channel preamble carrying a correlation identifier
    pub fn encode_preamble(correlation_id: Uuid) -> [u8; PREAMBLE_LEN] {
        *correlation_id.as_bytes()
    }

    /// Decode a data-channel preamble back into a correlation identifier
    pub fn decode_preamble(bytes: &[u8; PREAMBLE_LEN]) -> Uuid {
        Uuid::from_bytes(*bytes)
    }
}
