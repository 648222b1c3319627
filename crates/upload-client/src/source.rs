//! Byte-range-addressable upload sources.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use slicedrop_transfer::naming::{DEFAULT_EXTENSION, extension_from_name};

/// Something the session can hash and slice.
///
/// Reads are blocking; the coordinator calls them from the blocking pool.
pub trait ByteSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the source holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the half-open range `[start, end)`.
    fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>>;

    /// Extension used for the staged chunks and the artifact.
    fn extension(&self) -> String {
        DEFAULT_EXTENSION.to_string()
    }
}

/// A file on local disk.
///
/// The length is captured at open time; a file that changes size afterwards
/// makes later reads fail rather than silently shifting chunk boundaries.
pub struct FileSource {
    path: PathBuf,
    len: u64,
    file: Mutex<File>,
}

impl FileSource {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            len,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        check_range(start, end, self.len)?;
        let mut buf = vec![0u8; (end - start) as usize];
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn extension(&self) -> String {
        self.path
            .file_name()
            .map(|n| extension_from_name(&n.to_string_lossy()))
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
    }
}

/// An in-memory buffer.
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
    extension: String,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    /// Uses the extension of `name` (e.g. `clip.mp4` gives `mp4`).
    pub fn named(mut self, name: &str) -> Self {
        self.extension = extension_from_name(name);
        self
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        check_range(start, end, self.len())?;
        Ok(self.data[start as usize..end as usize].to_vec())
    }

    fn extension(&self) -> String {
        self.extension.clone()
    }
}

fn check_range(start: u64, end: u64, len: u64) -> io::Result<()> {
    if start > end || end > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("range {start}..{end} outside source of {len} bytes"),
        ));
    }
    Ok(())
}
