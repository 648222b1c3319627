use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{ChunkLayout, TransferError};
use crate::hasher::{Fingerprint, chunk_checksum};
use crate::index::{ChunkIndex, FsChunkIndex};
use crate::naming::{artifact_extension, artifact_file_name, chunk_file_name, validate_extension};
use crate::types::{ArtifactRef, ResumeInfo, StagedChunk, StoreOutcome};

/// Server-side persistence of chunks under `{root}/{fingerprint}/`.
///
/// Writers for different indices of one fingerprint touch disjoint files,
/// so `store_chunk` needs no locking.
#[derive(Clone)]
pub struct ChunkStore {
    root: PathBuf,
    index: Arc<dyn ChunkIndex>,
}

impl ChunkStore {
    /// Creates a store whose index is the staging directory listing.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index: Arc::new(FsChunkIndex::new(root.clone())),
            root,
        }
    }

    pub fn with_index(root: impl Into<PathBuf>, index: Arc<dyn ChunkIndex>) -> Self {
        Self {
            root: root.into(),
            index,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> &Arc<dyn ChunkIndex> {
        &self.index
    }

    pub fn staging_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.as_str())
    }

    /// Reports what is already held for `fingerprint`. Never writes.
    ///
    /// A merged artifact `{fingerprint}.{extension}` wins over a staging
    /// area; when `extension` is `None` any extension matches. When `size`
    /// is given, an artifact of another length is treated as absent.
    pub fn probe(
        &self,
        fingerprint: &Fingerprint,
        extension: Option<&str>,
        size: Option<u64>,
    ) -> Result<ResumeInfo, TransferError> {
        if let Some(ext) = extension {
            validate_extension(ext)?;
        }

        match find_artifact(&self.root, fingerprint, extension)? {
            Some(artifact) if size.is_some_and(|s| s != artifact.size) => {
                tracing::debug!(
                    %fingerprint,
                    expected = size,
                    actual = artifact.size,
                    "artifact size differs, ignoring it"
                );
            }
            Some(artifact) => return Ok(ResumeInfo::Merged(artifact)),
            None => {}
        }

        let Some(chunks) = self.index.staged(fingerprint)? else {
            return Ok(ResumeInfo::Fresh);
        };
        let layout = read_layout(&self.staging_dir(fingerprint))?;
        let mut present: Vec<u32> = chunks.iter().map(|c| c.index).collect();
        present.dedup();
        let file_names = chunks.into_iter().map(|c| c.file_name).collect();
        Ok(ResumeInfo::Staged {
            present,
            file_names,
            layout,
        })
    }

    /// Persists chunk `index` of `fingerprint` without pinning a layout.
    pub fn store_chunk(
        &self,
        fingerprint: &Fingerprint,
        index: u32,
        extension: &str,
        data: &[u8],
        checksum: Option<&str>,
    ) -> Result<StoreOutcome, TransferError> {
        self.store_planned_chunk(fingerprint, None, index, extension, data, checksum)
    }

    /// Persists chunk `index` of `fingerprint`.
    ///
    /// - Returns [`StoreOutcome::AlreadyExists`] without writing if the
    ///   artifact `{fingerprint}.{extension}` is already merged, or if the
    ///   chunk file is already present.
    /// - Creates the staging directory on first use. The first `layout`
    ///   seen pins the staging area; a different one later is a
    ///   [`TransferError::LayoutMismatch`].
    /// - With a layout, every chunk but the last must hold exactly
    ///   `chunk_size` bytes.
    /// - Verifies `checksum` (hex SHA-256) when non-empty.
    /// - Writes to a hidden temp file and renames it into place, so a
    ///   partially written chunk is never visible to the index.
    pub fn store_planned_chunk(
        &self,
        fingerprint: &Fingerprint,
        layout: Option<ChunkLayout>,
        index: u32,
        extension: &str,
        data: &[u8],
        checksum: Option<&str>,
    ) -> Result<StoreOutcome, TransferError> {
        if index == 0 {
            return Err(TransferError::InvalidIndex(index));
        }
        validate_extension(extension)?;
        if let Some(layout) = layout {
            check_chunk_fits(layout, index, data.len() as u64)?;
        }

        if let Some(expected) = checksum.filter(|c| !c.is_empty()) {
            let actual = chunk_checksum(data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(TransferError::ChecksumMismatch {
                    index,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        // A late or retried frame must not reopen staging for a merged file.
        if find_artifact(&self.root, fingerprint, Some(extension))?.is_some() {
            tracing::debug!(%fingerprint, index, "artifact already merged, chunk ignored");
            return Ok(StoreOutcome::AlreadyExists);
        }

        let write_err = |source| TransferError::ChunkWrite { index, source };
        let dir = self.staging_dir(fingerprint);
        std::fs::create_dir_all(&dir).map_err(write_err)?;
        if let Some(layout) = layout {
            pin_layout(&dir, layout)?;
        }

        let name = chunk_file_name(fingerprint, index, extension);
        let path = dir.join(&name);
        let staged = StagedChunk {
            index,
            extension: extension.to_string(),
            file_name: name.clone(),
        };

        if path.try_exists().map_err(write_err)? {
            tracing::debug!(%fingerprint, index, "chunk already staged");
            self.index.record(fingerprint, staged)?;
            return Ok(StoreOutcome::AlreadyExists);
        }

        let tmp = dir.join(format!(".{name}.tmp-{}", uuid::Uuid::new_v4()));
        if let Err(e) = write_file(&tmp, data).and_then(|()| std::fs::rename(&tmp, &path)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(write_err(e));
        }

        self.index.record(fingerprint, staged)?;
        tracing::debug!(%fingerprint, index, bytes = data.len(), "chunk stored");
        Ok(StoreOutcome::Stored)
    }
}

/// Chunks before the last hold exactly `chunk_size` bytes; the last one
/// holds the remainder, which the capped plan may make larger.
fn check_chunk_fits(layout: ChunkLayout, index: u32, len: u64) -> Result<(), TransferError> {
    if index > layout.total_chunks {
        return Err(TransferError::InvalidPlan(format!(
            "chunk {index} outside a plan of {} chunks",
            layout.total_chunks
        )));
    }
    if index < layout.total_chunks && len != layout.chunk_size {
        return Err(TransferError::ChunkLength {
            index,
            expected: layout.chunk_size,
            actual: len,
        });
    }
    Ok(())
}

/// Hidden record of the layout a staging area is pinned to.
const LAYOUT_FILE: &str = ".layout";

/// Reads the pinned layout of a staging directory.
pub(crate) fn read_layout(staging: &Path) -> Result<Option<ChunkLayout>, TransferError> {
    let text = match std::fs::read_to_string(staging.join(LAYOUT_FILE)) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let layout = text.trim().split_once(' ').and_then(|(size, total)| {
        Some(ChunkLayout {
            chunk_size: size.parse().ok()?,
            total_chunks: total.parse().ok()?,
        })
    });
    match layout {
        Some(layout) => Ok(Some(layout)),
        None => Err(TransferError::Io(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("unreadable layout record in {}", staging.display()),
        ))),
    }
}

/// Pins `layout` for a staging directory, or checks it against the pinned one.
fn pin_layout(staging: &Path, layout: ChunkLayout) -> Result<(), TransferError> {
    let check = |staged: ChunkLayout| {
        if staged == layout {
            Ok(())
        } else {
            Err(TransferError::LayoutMismatch {
                staged,
                requested: layout,
            })
        }
    };
    if let Some(staged) = read_layout(staging)? {
        return check(staged);
    }

    let tmp = staging.join(format!("{LAYOUT_FILE}.tmp-{}", uuid::Uuid::new_v4()));
    let record = format!("{} {}\n", layout.chunk_size, layout.total_chunks);
    let linked = write_file(&tmp, record.as_bytes())
        .and_then(|()| std::fs::hard_link(&tmp, staging.join(LAYOUT_FILE)));
    let _ = std::fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(()),
        // Another writer pinned first.
        Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_layout(staging)? {
            Some(staged) => check(staged),
            None => Ok(()),
        },
        Err(e) => Err(e.into()),
    }
}

/// Deletes the layout record of a consumed staging directory.
pub(crate) fn drop_layout(staging: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(staging.join(LAYOUT_FILE)) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Looks up the merged artifact of `fingerprint` in `root`.
pub(crate) fn find_artifact(
    root: &Path,
    fingerprint: &Fingerprint,
    extension: Option<&str>,
) -> Result<Option<ArtifactRef>, TransferError> {
    let file_name = match extension {
        Some(ext) => artifact_file_name(fingerprint, ext),
        None => {
            let entries = match std::fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let mut names = Vec::new();
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                match name.to_str() {
                    Some(name) if artifact_extension(fingerprint, name).is_some() => {
                        names.push(name.to_string());
                    }
                    _ => {}
                }
            }
            names.sort();
            match names.into_iter().next() {
                Some(name) => name,
                None => return Ok(None),
            }
        }
    };

    let path = root.join(&file_name);
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => Ok(Some(ArtifactRef {
            fingerprint: fingerprint.clone(),
            file_name,
            path,
            size: meta.len(),
        })),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
