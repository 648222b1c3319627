use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::TransferError;
use crate::hasher::Fingerprint;
use crate::naming::parse_chunk_file_name;
use crate::types::StagedChunk;

/// Maps a fingerprint to the chunks staged for it.
///
/// The store calls [`record`](ChunkIndex::record) after a chunk is durably
/// written and the merge engine calls [`forget`](ChunkIndex::forget) after
/// the staging area is consumed.
pub trait ChunkIndex: Send + Sync {
    /// Staged chunks sorted by numeric index, or `None` when no staging
    /// area exists for `fingerprint`.
    fn staged(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<StagedChunk>>, TransferError>;

    fn record(&self, fingerprint: &Fingerprint, chunk: StagedChunk) -> Result<(), TransferError>;

    fn forget(&self, fingerprint: &Fingerprint) -> Result<(), TransferError>;
}

/// Index backed by the staging directories themselves.
///
/// The directory listing is the source of truth, so `record` and `forget`
/// have nothing to do.
#[derive(Debug, Clone)]
pub struct FsChunkIndex {
    root: PathBuf,
}

impl FsChunkIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ChunkIndex for FsChunkIndex {
    fn staged(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<StagedChunk>>, TransferError> {
        let dir = self.root.join(fingerprint.as_str());
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut chunks = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            // In-flight writes use hidden temp names.
            if name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }
            match parse_chunk_file_name(&name) {
                Ok(parsed) if parsed.fingerprint == *fingerprint => chunks.push(StagedChunk {
                    index: parsed.index,
                    extension: parsed.extension,
                    file_name: name,
                }),
                _ => {
                    tracing::debug!(%fingerprint, file = %name, "ignoring foreign file in staging");
                }
            }
        }

        chunks.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.file_name.cmp(&b.file_name)));
        Ok(Some(chunks))
    }

    fn record(&self, _fingerprint: &Fingerprint, _chunk: StagedChunk) -> Result<(), TransferError> {
        Ok(())
    }

    fn forget(&self, _fingerprint: &Fingerprint) -> Result<(), TransferError> {
        Ok(())
    }
}

/// In-process index, for tests and for deployments that keep chunk
/// bookkeeping outside the filesystem.
#[derive(Debug, Default)]
pub struct MemoryChunkIndex {
    inner: RwLock<HashMap<Fingerprint, Vec<StagedChunk>>>,
}

impl MemoryChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkIndex for MemoryChunkIndex {
    fn staged(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<StagedChunk>>, TransferError> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(fingerprint).cloned())
    }

    fn record(&self, fingerprint: &Fingerprint, chunk: StagedChunk) -> Result<(), TransferError> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let chunks = map.entry(fingerprint.clone()).or_default();
        if !chunks.iter().any(|c| c.file_name == chunk.file_name) {
            chunks.push(chunk);
            chunks.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.file_name.cmp(&b.file_name)));
        }
        Ok(())
    }

    fn forget(&self, fingerprint: &Fingerprint) -> Result<(), TransferError> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(fingerprint);
        Ok(())
    }
}
