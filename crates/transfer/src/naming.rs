//! File naming for staged chunks and merged artifacts.
//!
//! Chunk: `{fingerprint}_{index}.{extension}` inside `{root}/{fingerprint}/`.
//! Artifact: `{fingerprint}.{extension}` inside `{root}/`.
//! Every component is validated so a name can never contain a separator
//! or `..` and escape the upload root.

use crate::TransferError;
use crate::hasher::Fingerprint;

/// Extension used when a file name carries none.
pub const DEFAULT_EXTENSION: &str = "bin";

/// Validates that an extension is non-empty ASCII alphanumeric.
pub fn validate_extension(ext: &str) -> Result<(), TransferError> {
    if ext.is_empty() || ext.len() > 16 || !ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(TransferError::InvalidExtension(ext.to_string()));
    }
    Ok(())
}

/// Derives the extension from a file name's trailing `.[0-9A-Za-z]+`.
///
/// Names without a usable extension map to [`DEFAULT_EXTENSION`].
pub fn extension_from_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && validate_extension(ext).is_ok() => {
            ext.to_string()
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

pub fn chunk_file_name(fingerprint: &Fingerprint, index: u32, extension: &str) -> String {
    format!("{fingerprint}_{index}.{extension}")
}

pub fn artifact_file_name(fingerprint: &Fingerprint, extension: &str) -> String {
    format!("{fingerprint}.{extension}")
}

/// Components of a parsed chunk file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub fingerprint: Fingerprint,
    pub index: u32,
    pub extension: String,
}

/// Parses `{fingerprint}_{index}.{extension}`.
///
/// The index must be canonical decimal (`1`, not `01` or `+1`) and at
/// least 1, so every chunk has exactly one valid name.
pub fn parse_chunk_file_name(name: &str) -> Result<ChunkName, TransferError> {
    let invalid = || TransferError::InvalidChunkName(name.to_string());

    let (stem, extension) = name.rsplit_once('.').ok_or_else(invalid)?;
    validate_extension(extension).map_err(|_| invalid())?;
    let (fp, idx) = stem.rsplit_once('_').ok_or_else(invalid)?;
    let fingerprint = Fingerprint::parse(fp).map_err(|_| invalid())?;
    if fingerprint.as_str() != fp {
        return Err(invalid());
    }
    let index: u32 = idx.parse().map_err(|_| invalid())?;
    if index == 0 || index.to_string() != idx {
        return Err(invalid());
    }

    Ok(ChunkName {
        fingerprint,
        index,
        extension: extension.to_string(),
    })
}

/// Parses `{fingerprint}.{extension}`, returning the extension when the
/// name is the artifact of `fingerprint`.
pub fn artifact_extension<'a>(fingerprint: &Fingerprint, name: &'a str) -> Option<&'a str> {
    let (stem, ext) = name.rsplit_once('.')?;
    (stem == fingerprint.as_str() && validate_extension(ext).is_ok()).then_some(ext)
}
