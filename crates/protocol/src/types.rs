use serde::{Deserialize, Serialize};

/// Outcome of a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// Machine-readable result code carried by every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Chunk persisted.
    Stored,
    /// Chunk or artifact was already present; nothing was written.
    AlreadyExists,
    /// Probe found a staging area.
    Staged,
    /// Probe found neither staging nor artifact.
    Fresh,
    /// Probe found a finished artifact.
    ArtifactExists,
    /// Chunks concatenated into the artifact.
    Merged,
    InvalidRequest,
    ChunkWriteFailed,
    ChecksumMismatch,
    ChunkIncomplete,
    StagingNotFound,
    MergeInProgress,
    MergeIo,
    FingerprintMismatch,
    /// Request disagrees with the layout the staging area is pinned to.
    PlanMismatch,
    Internal,
    /// Forward compatibility: unknown codes deserialize here.
    #[serde(other)]
    Unknown,
}

impl ResultCode {
    /// Returns the status implied by this code.
    pub fn status(self) -> Status {
        match self {
            ResultCode::Stored
            | ResultCode::AlreadyExists
            | ResultCode::Staged
            | ResultCode::Fresh
            | ResultCode::ArtifactExists
            | ResultCode::Merged => Status::Success,
            _ => Status::Failure,
        }
    }

    /// Returns `true` if resending the same request may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ResultCode::ChunkWriteFailed
                | ResultCode::ChecksumMismatch
                | ResultCode::MergeInProgress
                | ResultCode::Internal
        )
    }
}

/// The response contract shared by every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub status: Status,
    pub code: ResultCode,
    #[serde(default)]
    pub message: String,
    /// Stable reference to the merged file, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_location: Option<String>,
}

impl OperationResult {
    /// Builds a result whose status follows from `code`.
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status(),
            code,
            message: message.into(),
            artifact_location: None,
        }
    }

    /// Attaches an artifact location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.artifact_location = Some(location.into());
        self
    }

    /// Returns `true` for a success status.
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}
