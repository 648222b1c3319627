use std::path::PathBuf;

use crate::ChunkLayout;
use crate::hasher::Fingerprint;

/// A chunk present in a staging area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedChunk {
    /// 1-based chunk index parsed from the file name.
    pub index: u32,
    pub extension: String,
    pub file_name: String,
}

/// A merged file in the upload root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub fingerprint: Fingerprint,
    /// `{fingerprint}.{extension}`.
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// What the server already holds for a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeInfo {
    /// A staging area exists; `present` is ascending and parallel to `file_names`.
    Staged {
        present: Vec<u32>,
        file_names: Vec<String>,
        /// `None` until a writer pins one.
        layout: Option<ChunkLayout>,
    },
    /// The artifact is already merged.
    Merged(ArtifactRef),
    /// Nothing is known about this fingerprint.
    Fresh,
}

impl ResumeInfo {
    /// Indices in `1..=total_chunks` the server does not hold.
    pub fn missing(&self, total_chunks: u32) -> Vec<u32> {
        match self {
            ResumeInfo::Merged(_) => Vec::new(),
            ResumeInfo::Fresh => (1..=total_chunks).collect(),
            ResumeInfo::Staged { present, .. } => (1..=total_chunks)
                .filter(|i| present.binary_search(i).is_err())
                .collect(),
        }
    }

    /// Staged indices, empty unless a staging area exists.
    pub fn present(&self) -> &[u32] {
        match self {
            ResumeInfo::Staged { present, .. } => present,
            _ => &[],
        }
    }
}

/// Result of storing a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// A chunk with the same name was already staged; nothing was written.
    AlreadyExists,
}

/// Result of a successful merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(ArtifactRef),
    /// The staging area was already consumed by an earlier merge.
    AlreadyExists(ArtifactRef),
}

impl MergeOutcome {
    pub fn artifact(&self) -> &ArtifactRef {
        match self {
            MergeOutcome::Merged(a) | MergeOutcome::AlreadyExists(a) => a,
        }
    }
}
