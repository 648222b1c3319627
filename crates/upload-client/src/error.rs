//! Client and session error types.

use slicedrop_protocol::ResultCode;
use slicedrop_protocol::constants::MessageType;
use slicedrop_protocol::frame::FrameError;
use slicedrop_transfer::TransferError;
use tokio_tungstenite::tungstenite;

use crate::types::SessionPhase;

/// Errors from the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid chunk frame: {0}")]
    Frame(#[from] FrameError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("{0:?} reply carried no payload")]
    EmptyReply(MessageType),
}

impl ClientError {
    /// Returns `true` if resending the request over the same connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Timeout)
    }
}

/// What a caller can do after a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Start a new session: it re-probes and sends only missing chunks.
    Resume,
    /// Every chunk is staged; only the merge request needs repeating.
    RetryMerge,
    /// The source, plan or staged bytes are unusable; fix the source and
    /// start over from hashing. The server has already dropped staged bytes
    /// that failed verification.
    Restart,
}

/// The failure half of the cause of a failed session.
#[derive(Debug, thiserror::Error)]
pub enum SessionErrorKind {
    #[error("hash computation failed: {0}")]
    Hash(#[source] TransferError),

    #[error("invalid plan: {0}")]
    Plan(String),

    #[error("failed to read chunk {index} from source: {source}")]
    Source {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("probe rejected ({code:?}): {message}")]
    Probe { code: ResultCode, message: String },

    #[error("chunk {index} failed ({code:?}): {message}")]
    ChunkWrite {
        index: u32,
        code: ResultCode,
        message: String,
    },

    #[error("chunk {index} transport failure: {source}")]
    ChunkTransport {
        index: u32,
        #[source]
        source: ClientError,
    },

    #[error("chunk task failed: {0}")]
    Task(String),

    #[error("slice not fully uploaded yet: {0}")]
    ChunkIncomplete(String),

    #[error("staging area not found: {0}")]
    StagingNotFound(String),

    #[error("merge failed ({code:?}): {message}")]
    Merge { code: ResultCode, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] ClientError),

    #[error("cancelled")]
    Cancelled,
}

/// Terminal failure of an upload session, tagged with the phase it happened in.
#[derive(Debug, thiserror::Error)]
#[error("{phase} failed: {kind}")]
pub struct SessionError {
    pub phase: SessionPhase,
    #[source]
    pub kind: SessionErrorKind,
}

impl SessionError {
    pub fn new(phase: SessionPhase, kind: SessionErrorKind) -> Self {
        Self { phase, kind }
    }

    /// The server's result code, when the failure came from a reply.
    pub fn code(&self) -> Option<ResultCode> {
        match &self.kind {
            SessionErrorKind::Probe { code, .. }
            | SessionErrorKind::ChunkWrite { code, .. }
            | SessionErrorKind::Merge { code, .. } => Some(*code),
            SessionErrorKind::ChunkIncomplete(_) => Some(ResultCode::ChunkIncomplete),
            SessionErrorKind::StagingNotFound(_) => Some(ResultCode::StagingNotFound),
            _ => None,
        }
    }

    /// Suggests how to continue from this failure.
    pub fn recovery(&self) -> Recovery {
        match &self.kind {
            SessionErrorKind::Hash(_) | SessionErrorKind::Plan(_) => Recovery::Restart,
            SessionErrorKind::Source { .. } => Recovery::Restart,
            SessionErrorKind::Probe { code, .. } if *code == ResultCode::InvalidRequest => {
                Recovery::Restart
            }
            SessionErrorKind::Merge { code, .. } => match code {
                ResultCode::MergeIo | ResultCode::MergeInProgress | ResultCode::Internal => {
                    Recovery::RetryMerge
                }
                // A new session probes again and adopts the pinned layout.
                ResultCode::PlanMismatch => Recovery::Resume,
                _ => Recovery::Restart,
            },
            SessionErrorKind::Transport(_) if self.phase == SessionPhase::Merging => {
                Recovery::RetryMerge
            }
            _ => Recovery::Resume,
        }
    }
}
