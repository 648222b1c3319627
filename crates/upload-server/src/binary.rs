//! Typed decoding of inbound chunk frames.

use slicedrop_protocol::envelope::Message;
use slicedrop_protocol::frame::{self, FrameError};
use slicedrop_protocol::messages::ChunkHeader;

/// A chunk upload as received: its header and the raw bytes.
#[derive(Debug)]
pub struct BinaryChunk {
    pub header: ChunkHeader,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("invalid chunk header: {0}")]
    Header(#[from] serde_json::Error),
}

impl BinaryChunk {
    pub fn decode(raw: &[u8]) -> Result<Self, ParseError> {
        let (header, data) = frame::split(raw)?;
        Ok(Self {
            header: serde_json::from_slice(header)?,
            data: data.to_vec(),
        })
    }

    /// Request id of a frame whose header is otherwise unusable, so the
    /// error still reaches the waiting request.
    pub(crate) fn request_id(raw: &[u8]) -> Option<String> {
        let (header, _) = frame::split(raw).ok()?;
        Message::peek_id(header)
    }
}

#[cfg(test)]
pub(crate) fn encode_chunk(header: &ChunkHeader, data: &[u8]) -> Vec<u8> {
    frame::encode(&serde_json::to_vec(header).unwrap(), data).unwrap()
}
