//! Content fingerprints and chunk checksums.
//!
//! The fingerprint is an MD5 digest over the whole file. It is a dedup key,
//! not an integrity proof; per-chunk integrity uses SHA-256 checksums.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use md5::{Digest, Md5};
use sha2::Sha256;

use crate::TransferError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex MD5 digest identifying a file by its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parses a fingerprint, normalizing it to lowercase.
    ///
    /// Accepts exactly 32 hex characters; anything else could name a path
    /// outside the upload root and is rejected.
    pub fn parse(s: &str) -> Result<Self, TransferError> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TransferError::InvalidFingerprint(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Incremental fingerprint computation for streamed input.
#[derive(Default)]
pub struct FingerprintHasher {
    inner: Md5,
    bytes: u64,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Fingerprint {
        Fingerprint(hex::encode(self.inner.finalize()))
    }
}

/// Fingerprints an in-memory buffer.
pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    let mut hasher = FingerprintHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Fingerprints a file in a single streaming pass.
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = FingerprintHasher::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn chunk_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn known_digests() {
        assert_eq!(
            fingerprint_bytes(b"").as_str(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            fingerprint_bytes(b"a").as_str(),
            "0cc175b9c0f1b6a831c399e269772661"
        );
    }

    #[test]
    fn identical_bytes_identical_fingerprint() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(fingerprint_bytes(&data), fingerprint_bytes(&data.clone()));
        let mut other = data.clone();
        other[5_000] ^= 1;
        assert_ne!(fingerprint_bytes(&data), fingerprint_bytes(&other));
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let mut hasher = FingerprintHasher::new();
        for part in data.chunks(7) {
            hasher.update(part);
        }
        assert_eq!(hasher.bytes(), data.len() as u64);
        assert_eq!(hasher.finalize(), fingerprint_bytes(data));
    }

    #[test]
    fn file_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7) as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();
        assert_eq!(fingerprint_file(&path).unwrap(), fingerprint_bytes(&data));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = fingerprint_file(&dir.path().join("absent"));
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[test]
    fn parse_normalizes_case() {
        let fp = Fingerprint::parse("0CC175B9C0F1B6A831C399E269772661").unwrap();
        assert_eq!(fp.as_str(), "0cc175b9c0f1b6a831c399e269772661");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(Fingerprint::parse("").is_err());
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse("../../0f1b6a831c399e26977266100000").is_err());
        assert!(Fingerprint::parse("zcc175b9c0f1b6a831c399e269772661").is_err());
    }

    #[test]
    fn checksum_is_sha256_hex() {
        let c = chunk_checksum(b"hello world");
        assert_eq!(c.len(), 64);
        assert_eq!(c, chunk_checksum(b"hello world"));
        assert_ne!(c, chunk_checksum(b"hello"));
    }
}
