//! Content-addressed chunk staging and reassembly.
//!
//! A file is fingerprinted ([`hasher`]), partitioned into numbered byte
//! ranges ([`plan`]), staged chunk by chunk under a per-fingerprint
//! directory ([`ChunkStore`]) and finally concatenated in index order into
//! `{fingerprint}.{extension}` ([`MergeEngine`]). All operations are
//! synchronous filesystem work; async callers run them on a blocking pool.

pub mod hasher;
mod index;
mod merge;
pub mod naming;
pub mod plan;
mod store;
mod types;

pub use hasher::{Fingerprint, FingerprintHasher, chunk_checksum, fingerprint_bytes, fingerprint_file};
pub use index::{ChunkIndex, FsChunkIndex, MemoryChunkIndex};
pub use merge::MergeEngine;
pub use plan::{ChunkPlan, ChunkRange, plan};
pub use store::ChunkStore;
pub use types::{ArtifactRef, MergeOutcome, ResumeInfo, StagedChunk, StoreOutcome};

pub use slicedrop_protocol::messages::ChunkLayout;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("invalid extension: {0:?}")]
    InvalidExtension(String),

    #[error("invalid chunk name: {0}")]
    InvalidChunkName(String),

    #[error("invalid chunk index {0}: indices start at 1")]
    InvalidIndex(u32),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("checksum mismatch for chunk {index}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("failed to write chunk {index}: {source}")]
    ChunkWrite {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} path is not found")]
    StagingNotFound(String),

    #[error("the slice has not been uploaded: {staged} of {expected} chunks staged, missing {missing:?}")]
    Incomplete {
        expected: u32,
        staged: u32,
        missing: Vec<u32>,
    },

    #[error("staging holds chunks outside the plan of {count}: {unexpected:?}")]
    UnexpectedChunks { count: u32, unexpected: Vec<u32> },

    #[error(
        "staging is pinned to {} chunks of {} bytes, request planned {} chunks of {} bytes",
        .staged.total_chunks,
        .staged.chunk_size,
        .requested.total_chunks,
        .requested.chunk_size
    )]
    LayoutMismatch {
        staged: ChunkLayout,
        requested: ChunkLayout,
    },

    #[error("chunk {index} holds {actual} bytes, the plan expects {expected}")]
    ChunkLength { index: u32, expected: u64, actual: u64 },

    #[error("merge already in progress for {0}")]
    MergeInProgress(String),

    #[error("merge failed for {fingerprint}: {source}")]
    MergeIo {
        fingerprint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("merged content hashes to {actual}, expected {expected}")]
    FingerprintMismatch { expected: String, actual: String },
}
