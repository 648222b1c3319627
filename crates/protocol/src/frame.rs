//! Binary chunk frames: `[u32 BE header length][JSON header][chunk bytes]`.

/// Size of the big-endian header length prefix.
pub const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame shorter than its 4 byte length prefix")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("header of {0} bytes does not fit the length prefix")]
    HeaderTooLarge(usize),
}

/// Concatenates a serialized header and the chunk bytes into one frame.
pub fn encode(header: &[u8], data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(header.len()).map_err(|_| FrameError::HeaderTooLarge(header.len()))?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + header.len() + data.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(header);
    frame.extend_from_slice(data);
    Ok(frame)
}

/// Splits a frame into its header bytes and chunk bytes.
pub fn split(frame: &[u8]) -> Result<(&[u8], &[u8]), FrameError> {
    let (prefix, rest) = frame
        .split_first_chunk::<LENGTH_PREFIX>()
        .ok_or(FrameError::TooShort)?;
    let expected = u32::from_be_bytes(*prefix) as usize;
    if rest.len() < expected {
        return Err(FrameError::HeaderTruncated {
            expected,
            got: rest.len(),
        });
    }
    Ok(rest.split_at(expected))
}
