use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default ceiling for a single chunk (100 KiB).
pub const DEFAULT_MAX_CHUNK_BYTES: u64 = 100 * 1024;

/// Default cap on the number of chunks per file.
///
/// Files that would need more chunks than this at the ceiling size get a
/// larger chunk size instead.
pub const DEFAULT_MAX_CHUNK_COUNT: u32 = 100;

/// Time to wait for a pong response (or any incoming message).
///
/// If *nothing* arrives within this window the connection is
/// considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (256 MiB).
///
/// Bounds a single binary chunk frame, so it also bounds the largest
/// chunk a plan may produce.
pub const WS_MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Bytes reserved in a binary frame for the length prefix and JSON header.
pub const BINARY_HEADER_RESERVE: usize = 64 * 1024;

/// Timeout for request/response operations (text messages).
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for binary request/response operations (chunk uploads).
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for merge requests.
///
/// The server concatenates and fingerprints the whole file before
/// replying, so this scales with file size rather than chunk size.
pub const WS_MERGE_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from client to server
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "probe_chunks")]
    ProbeChunks,
    #[serde(rename = "merge_chunks")]
    MergeChunks,

    // Responses from server to client
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "probe_result")]
    ProbeResult,
    #[serde(rename = "chunk_ack")]
    ChunkAck,
    #[serde(rename = "merge_result")]
    MergeResult,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::ProbeChunks).unwrap(),
            "\"probe_chunks\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::ChunkAck).unwrap(),
            "\"chunk_ack\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::MergeResult).unwrap(),
            "\"merge_result\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"merge_chunks\"").unwrap();
        assert_eq!(mt, MessageType::MergeChunks);
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"some_future_type\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn frame_limit_leaves_room_for_header() {
        assert!(BINARY_HEADER_RESERVE < WS_MAX_MESSAGE_SIZE);
        assert!((DEFAULT_MAX_CHUNK_BYTES as usize) < WS_MAX_MESSAGE_SIZE - BINARY_HEADER_RESERVE);
    }
}
