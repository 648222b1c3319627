use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{ChunkLayout, TransferError};
use crate::hasher::{Fingerprint, FingerprintHasher};
use crate::index::{ChunkIndex, FsChunkIndex};
use crate::naming::{artifact_file_name, validate_extension};
use crate::store::{ChunkStore, drop_layout, find_artifact, read_layout};
use crate::types::{ArtifactRef, MergeOutcome, StagedChunk};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on missing indices carried by [`TransferError::Incomplete`].
const MAX_REPORTED_MISSING: usize = 256;

/// Concatenates a complete staging area into `{root}/{fingerprint}.{ext}`.
///
/// The artifact is assembled in a hidden temp file and renamed into place
/// only after every chunk was copied (and, with verification on, the
/// content hashed back to the fingerprint). Chunk files are deleted after
/// the rename, so any failure before it leaves no artifact behind and,
/// except for a content mismatch, leaves staging untouched.
pub struct MergeEngine {
    root: PathBuf,
    index: Arc<dyn ChunkIndex>,
    verify: bool,
    active: Mutex<HashSet<Fingerprint>>,
}

struct MergeGuard<'a> {
    active: &'a Mutex<HashSet<Fingerprint>>,
    fingerprint: Fingerprint,
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.fingerprint);
    }
}

impl MergeEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self::with_index(root.clone(), Arc::new(FsChunkIndex::new(root)))
    }

    pub fn with_index(root: impl Into<PathBuf>, index: Arc<dyn ChunkIndex>) -> Self {
        Self {
            root: root.into(),
            index,
            verify: true,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Creates an engine sharing `store`'s root and index.
    pub fn for_store(store: &ChunkStore) -> Self {
        Self::with_index(store.root().to_path_buf(), Arc::clone(store.index()))
    }

    /// Enables or disables hashing the merged content against the fingerprint.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Merges chunks `1..=count` of `fingerprint`.
    ///
    /// `extension` overrides the one recorded in the first chunk name.
    pub fn merge(
        &self,
        fingerprint: &Fingerprint,
        count: u32,
        extension: Option<&str>,
    ) -> Result<MergeOutcome, TransferError> {
        self.merge_checked(fingerprint, count, None, extension)
    }

    /// Like [`merge`](Self::merge), also requiring the staged chunks to
    /// follow `layout`.
    pub fn merge_planned(
        &self,
        fingerprint: &Fingerprint,
        layout: ChunkLayout,
        extension: Option<&str>,
    ) -> Result<MergeOutcome, TransferError> {
        self.merge_checked(
            fingerprint,
            layout.total_chunks,
            Some(layout.chunk_size),
            extension,
        )
    }

    fn merge_checked(
        &self,
        fingerprint: &Fingerprint,
        count: u32,
        chunk_size: Option<u64>,
        extension: Option<&str>,
    ) -> Result<MergeOutcome, TransferError> {
        if count == 0 {
            return Err(TransferError::InvalidPlan("merge of zero chunks".into()));
        }
        if let Some(ext) = extension {
            validate_extension(ext)?;
        }

        let _guard = self.begin(fingerprint)?;

        let Some(chunks) = self.index.staged(fingerprint)? else {
            return match find_artifact(&self.root, fingerprint, extension)? {
                Some(artifact) => {
                    tracing::debug!(%fingerprint, "staging already merged");
                    Ok(MergeOutcome::AlreadyExists(artifact))
                }
                None => Err(TransferError::StagingNotFound(fingerprint.to_string())),
            };
        };

        let staging = self.root.join(fingerprint.as_str());
        let pinned = read_layout(&staging)?;
        if let Some(staged) = pinned {
            let requested = ChunkLayout {
                chunk_size: chunk_size.unwrap_or(staged.chunk_size),
                total_chunks: count,
            };
            if staged != requested {
                return Err(TransferError::LayoutMismatch { staged, requested });
            }
        }

        check_complete(&chunks, count)?;
        if let Some(size) = pinned.map(|l| l.chunk_size).or(chunk_size) {
            check_lengths(fingerprint, &staging, &chunks, count, size)?;
        }

        let extension = match extension {
            Some(ext) => ext.to_string(),
            None => chunks[0].extension.clone(),
        };
        validate_extension(&extension)?;

        let file_name = artifact_file_name(fingerprint, &extension);
        let path = self.root.join(&file_name);
        let tmp = self
            .root
            .join(format!(".{file_name}.merge-{}", uuid::Uuid::new_v4()));

        let merge_io = |source| TransferError::MergeIo {
            fingerprint: fingerprint.to_string(),
            source,
        };

        let (actual, size) = match concatenate(&staging, &chunks, &tmp) {
            Ok(result) => result,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(merge_io(e));
            }
        };

        if self.verify && actual != *fingerprint {
            let _ = std::fs::remove_file(&tmp);
            // Bytes that fail verification are dropped with the staging area.
            tracing::warn!(%fingerprint, %actual, "merged content does not match, discarding staging");
            self.release_staging(fingerprint, &staging, &chunks);
            return Err(TransferError::FingerprintMismatch {
                expected: fingerprint.to_string(),
                actual: actual.to_string(),
            });
        }

        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(merge_io(e));
        }

        self.release_staging(fingerprint, &staging, &chunks);

        tracing::info!(%fingerprint, chunks = count, bytes = size, file = %file_name, "merged");
        Ok(MergeOutcome::Merged(ArtifactRef {
            fingerprint: fingerprint.clone(),
            file_name,
            path,
            size,
        }))
    }

    fn begin(&self, fingerprint: &Fingerprint) -> Result<MergeGuard<'_>, TransferError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(fingerprint.clone()) {
            return Err(TransferError::MergeInProgress(fingerprint.to_string()));
        }
        Ok(MergeGuard {
            active: &self.active,
            fingerprint: fingerprint.clone(),
        })
    }

    /// Deletes staged chunks in index order, then the staging directory.
    /// Failures here only leak space.
    fn release_staging(&self, fingerprint: &Fingerprint, staging: &Path, chunks: &[StagedChunk]) {
        for chunk in chunks {
            if let Err(e) = std::fs::remove_file(staging.join(&chunk.file_name)) {
                tracing::warn!(%fingerprint, index = chunk.index, "failed to delete staged chunk: {e}");
            }
        }
        if let Err(e) = self.index.forget(fingerprint) {
            tracing::warn!(%fingerprint, "failed to drop index entry: {e}");
        }
        if let Err(e) = drop_layout(staging) {
            tracing::warn!(%fingerprint, "failed to delete layout record: {e}");
        }
        if let Err(e) = std::fs::remove_dir(staging) {
            tracing::warn!(%fingerprint, "failed to remove staging directory: {e}");
        }
    }
}

/// Requires staged indices to be exactly `1..=count`.
fn check_complete(chunks: &[StagedChunk], count: u32) -> Result<(), TransferError> {
    let mut seen = HashSet::with_capacity(chunks.len());
    let mut unexpected = Vec::new();
    for chunk in chunks {
        if chunk.index > count || !seen.insert(chunk.index) {
            unexpected.push(chunk.index);
        }
    }

    let staged = seen.iter().filter(|&&i| i <= count).count() as u32;
    if staged < count {
        let missing = (1..=count)
            .filter(|i| !seen.contains(i))
            .take(MAX_REPORTED_MISSING)
            .collect();
        return Err(TransferError::Incomplete {
            expected: count,
            staged,
            missing,
        });
    }

    if !unexpected.is_empty() {
        return Err(TransferError::UnexpectedChunks { count, unexpected });
    }
    Ok(())
}

/// Requires chunks before `count` to hold exactly `chunk_size` bytes.
fn check_lengths(
    fingerprint: &Fingerprint,
    staging: &Path,
    chunks: &[StagedChunk],
    count: u32,
    chunk_size: u64,
) -> Result<(), TransferError> {
    for chunk in chunks.iter().filter(|c| c.index < count) {
        let actual = std::fs::metadata(staging.join(&chunk.file_name))
            .map_err(|source| TransferError::MergeIo {
                fingerprint: fingerprint.to_string(),
                source,
            })?
            .len();
        if actual != chunk_size {
            return Err(TransferError::ChunkLength {
                index: chunk.index,
                expected: chunk_size,
                actual,
            });
        }
    }
    Ok(())
}

/// Appends every chunk to `out` in order, hashing as it goes.
fn concatenate(
    staging: &Path,
    chunks: &[StagedChunk],
    out: &Path,
) -> std::io::Result<(Fingerprint, u64)> {
    let mut file = std::fs::File::create(out)?;
    let mut hasher = FingerprintHasher::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    for chunk in chunks {
        let mut src = std::fs::File::open(staging.join(&chunk.file_name))?;
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
        }
    }

    file.sync_all()?;
    let size = hasher.bytes();
    Ok((hasher.finalize(), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{fingerprint_bytes, fingerprint_file};
    use crate::index::MemoryChunkIndex;
    use crate::naming::chunk_file_name;
    use crate::plan::plan;
    use crate::types::{ResumeInfo, StoreOutcome};
    use tempfile::TempDir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    /// Stages every chunk of `data` except those in `skip`.
    fn stage(store: &ChunkStore, data: &[u8], max: u64, skip: &[u32]) -> (Fingerprint, u32) {
        let fp = fingerprint_bytes(data);
        let p = plan(fp.clone(), "bin", data.len() as u64, max, 100).unwrap();
        for r in p.ranges() {
            if skip.contains(&r.index) {
                continue;
            }
            let bytes = &data[r.start as usize..r.end as usize];
            assert_eq!(
                store.store_chunk(&fp, r.index, "bin", bytes, None).unwrap(),
                StoreOutcome::Stored
            );
        }
        (fp, p.total_chunks)
    }

    fn visible_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn merge_reproduces_original_bytes() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let engine = MergeEngine::for_store(&store);
        let data = sample(250 * 1024);
        let (fp, count) = stage(&store, &data, 100 * 1024, &[]);
        assert_eq!(count, 3);

        let outcome = engine.merge(&fp, count, None).unwrap();
        let MergeOutcome::Merged(artifact) = outcome else {
            panic!("expected fresh merge");
        };
        assert_eq!(artifact.size, data.len() as u64);
        assert_eq!(artifact.file_name, format!("{fp}.bin"));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), data);
        assert_eq!(fingerprint_file(&artifact.path).unwrap(), fp);
        assert!(!store.staging_dir(&fp).exists());
        assert_eq!(visible_entries(dir.path()), vec![artifact.file_name]);
    }

    #[test]
    fn merge_orders_by_numeric_index() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let data = sample(1_200);
        // 12 chunks: lexical order would put 10 and 11 before 2.
        let (fp, count) = stage(&store, &data, 100, &[]);
        assert_eq!(count, 12);

        let outcome = MergeEngine::for_store(&store).merge(&fp, count, None).unwrap();
        assert_eq!(std::fs::read(&outcome.artifact().path).unwrap(), data);
    }

    #[test]
    fn incomplete_merge_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let data = sample(700);
        let (fp, count) = stage(&store, &data, 100, &[2, 4, 5, 6]);
        assert_eq!(count, 7);

        let err = MergeEngine::for_store(&store).merge(&fp, count, None).unwrap_err();
        match err {
            TransferError::Incomplete {
                expected,
                staged,
                missing,
            } => {
                assert_eq!(expected, 7);
                assert_eq!(staged, 3);
                assert_eq!(missing, vec![2, 4, 5, 6]);
            }
            other => panic!("expected incomplete, got {other:?}"),
        }
        assert_eq!(visible_entries(dir.path()), vec![fp.to_string()]);
        assert_eq!(visible_entries(&store.staging_dir(&fp)).len(), 3);
    }

    #[test]
    fn missing_staging_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = MergeEngine::new(dir.path());
        let fp = fingerprint_bytes(b"nobody");
        assert!(matches!(
            engine.merge(&fp, 3, None),
            Err(TransferError::StagingNotFound(_))
        ));
    }

    #[test]
    fn second_merge_reports_existing_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let engine = MergeEngine::for_store(&store);
        let data = sample(300);
        let (fp, count) = stage(&store, &data, 100, &[]);

        let first = engine.merge(&fp, count, None).unwrap();
        let second = engine.merge(&fp, count, None).unwrap();
        assert!(matches!(second, MergeOutcome::AlreadyExists(_)));
        assert_eq!(first.artifact(), second.artifact());
    }

    #[test]
    fn chunks_beyond_count_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let data = sample(500);
        let (fp, _) = stage(&store, &data, 100, &[]);

        let err = MergeEngine::for_store(&store).merge(&fp, 3, None).unwrap_err();
        match err {
            TransferError::UnexpectedChunks { count, unexpected } => {
                assert_eq!(count, 3);
                assert_eq!(unexpected, vec![4, 5]);
            }
            other => panic!("expected plan mismatch, got {other:?}"),
        }
        assert!(store.staging_dir(&fp).exists());
    }

    #[test]
    fn gap_is_reported_before_extras() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let data = sample(500);
        let (fp, _) = stage(&store, &data, 100, &[3, 4]);

        let err = MergeEngine::for_store(&store).merge(&fp, 3, None).unwrap_err();
        assert!(matches!(
            err,
            TransferError::Incomplete { staged: 2, ref missing, .. } if missing == &[3]
        ));
    }

    #[test]
    fn content_must_hash_to_fingerprint() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let fp = fingerprint_bytes(b"claimed content");
        store.store_chunk(&fp, 1, "bin", b"actual content", None).unwrap();

        let err = MergeEngine::for_store(&store).merge(&fp, 1, None).unwrap_err();
        assert!(matches!(err, TransferError::FingerprintMismatch { .. }));
        // Neither an artifact nor the unusable staging area survives.
        assert!(visible_entries(dir.path()).is_empty());
        assert_eq!(store.probe(&fp, None, None).unwrap(), ResumeInfo::Fresh);

        store.store_chunk(&fp, 1, "bin", b"actual content", None).unwrap();
        let outcome = MergeEngine::for_store(&store)
            .verify(false)
            .merge(&fp, 1, None)
            .unwrap();
        assert_eq!(std::fs::read(&outcome.artifact().path).unwrap(), b"actual content");
    }

    /// Stages every chunk of `data` under the layout of a `max`-byte plan.
    fn stage_planned(store: &ChunkStore, data: &[u8], max: u64) -> (Fingerprint, ChunkLayout) {
        let fp = fingerprint_bytes(data);
        let p = plan(fp.clone(), "bin", data.len() as u64, max, 100).unwrap();
        for r in p.ranges() {
            let bytes = &data[r.start as usize..r.end as usize];
            store
                .store_planned_chunk(&fp, Some(p.layout()), r.index, "bin", bytes, None)
                .unwrap();
        }
        (fp, p.layout())
    }

    #[test]
    fn late_chunk_after_merge_leaves_artifact_visible() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let data = sample(300);
        let (fp, layout) = stage_planned(&store, &data, 100);
        MergeEngine::for_store(&store)
            .merge_planned(&fp, layout, None)
            .unwrap();
        assert!(!store.staging_dir(&fp).exists(), "layout record left behind");

        // A retried frame for chunk 2 lands after the merge.
        let late = store
            .store_planned_chunk(&fp, Some(layout), 2, "bin", &data[100..200], None)
            .unwrap();
        assert_eq!(late, StoreOutcome::AlreadyExists);
        assert!(!store.staging_dir(&fp).exists());
        assert!(matches!(
            store.probe(&fp, Some("bin"), Some(300)).unwrap(),
            ResumeInfo::Merged(_)
        ));
    }

    #[test]
    fn merge_checks_pinned_layout() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let engine = MergeEngine::for_store(&store);
        let data = sample(300);
        let (fp, layout) = stage_planned(&store, &data, 100);

        let smaller = ChunkLayout {
            chunk_size: 50,
            total_chunks: 6,
        };
        assert!(matches!(
            engine.merge_planned(&fp, smaller, None),
            Err(TransferError::LayoutMismatch { staged, .. }) if staged == layout
        ));
        assert!(matches!(
            engine.merge(&fp, 6, None),
            Err(TransferError::LayoutMismatch { .. })
        ));
        assert!(store.staging_dir(&fp).exists());

        let outcome = engine.merge_planned(&fp, layout, None).unwrap();
        assert_eq!(std::fs::read(&outcome.artifact().path).unwrap(), data);
    }

    #[test]
    fn unpinned_chunks_of_another_size_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let data = sample(300);
        // Staged at 150 bytes a chunk, merged as a 100-byte plan of 2.
        let (fp, _) = stage(&store, &data, 150, &[]);

        let err = MergeEngine::for_store(&store)
            .merge_planned(
                &fp,
                ChunkLayout {
                    chunk_size: 100,
                    total_chunks: 2,
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::ChunkLength {
                index: 1,
                expected: 100,
                actual: 150
            }
        ));
    }

    #[test]
    fn io_failure_leaves_staging_intact() {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(MemoryChunkIndex::new());
        let store = ChunkStore::with_index(dir.path(), index.clone());
        let data = sample(200);
        let (fp, count) = stage(&store, &data, 100, &[]);

        // Index claims a chunk whose file has vanished.
        std::fs::remove_file(store.staging_dir(&fp).join(chunk_file_name(&fp, 2, "bin"))).unwrap();

        let err = MergeEngine::for_store(&store).merge(&fp, count, None).unwrap_err();
        assert!(matches!(err, TransferError::MergeIo { .. }));
        assert_eq!(visible_entries(dir.path()), vec![fp.to_string()]);
        assert_eq!(
            visible_entries(&store.staging_dir(&fp)),
            vec![chunk_file_name(&fp, 1, "bin")]
        );
        assert!(index.staged(&fp).unwrap().is_some());
    }

    #[test]
    fn concurrent_merge_of_same_fingerprint_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let engine = MergeEngine::for_store(&store);
        let data = sample(200);
        let (fp, count) = stage(&store, &data, 100, &[]);

        let guard = engine.begin(&fp).unwrap();
        assert!(matches!(
            engine.merge(&fp, count, None),
            Err(TransferError::MergeInProgress(_))
        ));
        drop(guard);
        assert!(engine.merge(&fp, count, None).is_ok());
    }

    #[test]
    fn extension_override_names_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let data = sample(150);
        let (fp, count) = stage(&store, &data, 100, &[]);

        let outcome = MergeEngine::for_store(&store)
            .merge(&fp, count, Some("dat"))
            .unwrap();
        assert_eq!(outcome.artifact().file_name, format!("{fp}.dat"));
    }

    #[test]
    fn zero_count_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = MergeEngine::new(dir.path());
        assert!(matches!(
            engine.merge(&fingerprint_bytes(b"x"), 0, None),
            Err(TransferError::InvalidPlan(_))
        ));
    }
}
