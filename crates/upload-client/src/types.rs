//! Public types for upload sessions.

use std::fmt;
use std::time::Duration;

use slicedrop_protocol::ResultCode;
use slicedrop_protocol::constants::{DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_CHUNK_COUNT};
use slicedrop_transfer::Fingerprint;

use crate::error::Recovery;

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Computing the fingerprint and chunk plan. No network I/O.
    Hashing,
    /// Asking the server what it already holds for the fingerprint.
    Probing,
    /// Sending the chunks the server does not have.
    Uploading,
    /// Every chunk acknowledged; waiting for the server to concatenate.
    Merging,
    Done,
    Failed,
}

impl SessionPhase {
    /// Returns `true` for `Done` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Done | SessionPhase::Failed)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Hashing => "hashing",
            SessionPhase::Probing => "probing",
            SessionPhase::Uploading => "uploading",
            SessionPhase::Merging => "merging",
            SessionPhase::Done => "done",
            SessionPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tuning knobs for an upload session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Chunk size ceiling in bytes.
    pub max_chunk_bytes: u64,
    /// Maximum number of chunks per file.
    pub max_chunk_count: u32,
    /// Chunk uploads in flight at once.
    pub concurrency: usize,
    /// Extra attempts per chunk after a retryable failure.
    pub retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    pub retry_delay: Duration,
    /// Attach a SHA-256 checksum to each chunk for server-side verification.
    pub checksums: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_chunk_count: DEFAULT_MAX_CHUNK_COUNT,
            concurrency: 4,
            retries: 3,
            retry_delay: Duration::from_millis(250),
            checksums: true,
        }
    }
}

impl SessionConfig {
    /// Backoff before retry `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.retry_delay.saturating_mul(1 << exp)
    }
}

/// Terminal success of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub fingerprint: Fingerprint,
    /// Where the server says the merged file can be retrieved.
    pub artifact_location: Option<String>,
    pub file_name: Option<String>,
    pub size: Option<u64>,
    /// The server already had the artifact; nothing was uploaded or merged.
    pub instant: bool,
    /// Chunks sent by this session.
    pub uploaded_chunks: u32,
    /// Chunks the server already had staged.
    pub resumed_chunks: u32,
}

/// Progress event emitted by an [`crate::UploadSession`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session entered a new phase.
    PhaseChanged(SessionPhase),
    /// Fingerprint and plan are known. Sent again while probing when the
    /// session switches to the layout pinned by an earlier session.
    Planned {
        fingerprint: Fingerprint,
        total_chunks: u32,
        chunk_size: u64,
        file_size: u64,
    },
    /// The server already had this chunk staged.
    ChunkSkipped { index: u32 },
    /// The server acknowledged a chunk sent by this session.
    ChunkAcknowledged {
        index: u32,
        bytes: u64,
        acknowledged: u32,
        total: u32,
    },
    /// A chunk failed with a retryable error and will be resent.
    ChunkRetry {
        index: u32,
        attempt: u32,
        reason: String,
    },
    /// Terminal success.
    Done(UploadOutcome),
    /// Terminal failure.
    Failed {
        phase: SessionPhase,
        code: Option<ResultCode>,
        message: String,
        recovery: Recovery,
    },
}
