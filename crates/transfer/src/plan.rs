//! Deterministic partitioning of a file into numbered byte ranges.

use slicedrop_protocol::constants::{DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_CHUNK_COUNT};

use crate::hasher::Fingerprint;
use crate::{ChunkLayout, TransferError};

/// How a file is split for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub fingerprint: Fingerprint,
    pub total_chunks: u32,
    /// Nominal chunk size; only the last chunk may differ.
    pub chunk_size: u64,
    pub file_extension: String,
    pub file_size: u64,
}

/// Half-open byte range `[start, end)` of chunk `index` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Plans chunks for a file of `file_size` bytes.
///
/// Chunks start at `max_chunk_bytes`. When that would need more than
/// `max_chunk_count` chunks, the size becomes `file_size / max_chunk_count`
/// and the count is pinned to the cap; the last chunk absorbs the remainder.
pub fn plan(
    fingerprint: Fingerprint,
    file_extension: impl Into<String>,
    file_size: u64,
    max_chunk_bytes: u64,
    max_chunk_count: u32,
) -> Result<ChunkPlan, TransferError> {
    if max_chunk_bytes == 0 {
        return Err(TransferError::InvalidPlan("chunk size ceiling is zero".into()));
    }
    if max_chunk_count == 0 {
        return Err(TransferError::InvalidPlan("chunk count cap is zero".into()));
    }

    let (chunk_size, total_chunks) = partition(file_size, max_chunk_bytes, max_chunk_count);
    Ok(ChunkPlan {
        fingerprint,
        total_chunks,
        chunk_size,
        file_extension: file_extension.into(),
        file_size,
    })
}

/// Returns `(chunk_size, count)`. Both limits must be non-zero.
fn partition(file_size: u64, max_chunk_bytes: u64, max_chunk_count: u32) -> (u64, u32) {
    let cap = u64::from(max_chunk_count);
    let count = file_size.div_ceil(max_chunk_bytes);
    if count > cap {
        (file_size / cap, max_chunk_count)
    } else {
        // count <= cap, so it fits in u32.
        (max_chunk_bytes, count as u32)
    }
}

impl ChunkPlan {
    /// Plans with the default 100 KiB ceiling and 100-chunk cap.
    pub fn with_defaults(
        fingerprint: Fingerprint,
        file_extension: impl Into<String>,
        file_size: u64,
    ) -> Self {
        let (chunk_size, total_chunks) =
            partition(file_size, DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_CHUNK_COUNT);
        Self {
            fingerprint,
            total_chunks,
            chunk_size,
            file_extension: file_extension.into(),
            file_size,
        }
    }

    /// Rebuilds the plan a staging area was pinned to.
    ///
    /// Fails unless `layout` partitions `file_size` into non-empty chunks.
    pub fn from_layout(
        fingerprint: Fingerprint,
        file_extension: impl Into<String>,
        file_size: u64,
        layout: ChunkLayout,
    ) -> Result<Self, TransferError> {
        let ChunkLayout {
            chunk_size,
            total_chunks,
        } = layout;
        let before_last = u64::from(total_chunks.saturating_sub(1)).checked_mul(chunk_size);
        match before_last {
            Some(start) if chunk_size > 0 && total_chunks > 0 && start < file_size => Ok(Self {
                fingerprint,
                total_chunks,
                chunk_size,
                file_extension: file_extension.into(),
                file_size,
            }),
            _ => Err(TransferError::InvalidPlan(format!(
                "{total_chunks} chunks of {chunk_size} bytes do not partition {file_size} bytes"
            ))),
        }
    }

    pub fn layout(&self) -> ChunkLayout {
        ChunkLayout {
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
        }
    }

    /// Returns the range of chunk `index`, or `None` outside `1..=total_chunks`.
    pub fn range(&self, index: u32) -> Option<ChunkRange> {
        if index == 0 || index > self.total_chunks {
            return None;
        }
        let start = u64::from(index - 1) * self.chunk_size;
        let end = if index == self.total_chunks {
            self.file_size
        } else {
            u64::from(index) * self.chunk_size
        };
        Some(ChunkRange { index, start, end })
    }

    /// All chunk ranges in index order.
    pub fn ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        (1..=self.total_chunks).filter_map(|i| self.range(i))
    }

    /// Length of the largest chunk in the plan.
    pub fn largest_chunk(&self) -> u64 {
        self.ranges().map(|r| r.len()).max().unwrap_or(0)
    }
}
