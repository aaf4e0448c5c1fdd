//! On-disk record codec.
//!
//! Records are stored back to back in segment files as little-endian frames:
//!
//! ```text
//! total_size: u32   byte length of the whole frame, including this field
//! key_len:    u32
//! value_len:  u32
//! key:        key_len bytes
//! value:      value_len bytes
//! checksum:   20 bytes, SHA-1 over header + key + value
//! ```
//!
//! The checksum window covers everything before the checksum itself and
//! nothing else. [`decode`] parses a frame without verifying the checksum;
//! readers call [`verify`] first when integrity matters (reads and replay).

use crate::error::{CoreError, CoreResult};
use sha1::{Digest, Sha1};

/// Fixed header size: total_size (4) + key_len (4) + value_len (4).
pub const HEADER_SIZE: usize = 12;

/// Trailing checksum size (SHA-1 digest).
pub const CHECKSUM_SIZE: usize = 20;

/// Smallest possible frame: empty key and value.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + CHECKSUM_SIZE;

/// A decoded key-value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record key.
    pub key: String,
    /// Record value.
    pub value: String,
    /// Stored checksum, as read from the frame (not verified by [`decode`]).
    pub checksum: [u8; CHECKSUM_SIZE],
}

/// Returns the encoded frame length for a key-value pair.
#[must_use]
pub fn encoded_len(key: &str, value: &str) -> usize {
    key.len() + value.len() + MIN_FRAME_SIZE
}

/// Encodes a key-value pair into a frame.
#[must_use]
pub fn encode(key: &str, value: &str) -> Vec<u8> {
    let total = encoded_len(key, value);
    let mut buf = Vec::with_capacity(total);

    buf.extend_from_slice(&(total as u32).to_le_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value.as_bytes());

    let digest = Sha1::digest(&buf);
    buf.extend_from_slice(&digest);

    buf
}

/// Decodes a frame into a [`Record`].
///
/// The checksum is parsed but not verified; callers that need integrity
/// checking call [`verify`] on the raw frame first.
///
/// # Errors
///
/// Returns [`CoreError::Corrupt`] if the header is malformed, the declared
/// `total_size` exceeds the available bytes, or the key/value bytes are not
/// valid UTF-8.
pub fn decode(data: &[u8]) -> CoreResult<Record> {
    let total = frame_len(data)?;

    let key_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let value_len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;

    if HEADER_SIZE + key_len + value_len + CHECKSUM_SIZE != total {
        return Err(CoreError::corrupt(format!(
            "frame length {total} inconsistent with key_len {key_len} and value_len {value_len}"
        )));
    }

    let key = std::str::from_utf8(&data[HEADER_SIZE..HEADER_SIZE + key_len])
        .map_err(|_| CoreError::corrupt("key is not valid UTF-8"))?
        .to_owned();
    let value_start = HEADER_SIZE + key_len;
    let value = std::str::from_utf8(&data[value_start..value_start + value_len])
        .map_err(|_| CoreError::corrupt("value is not valid UTF-8"))?
        .to_owned();

    let mut checksum = [0u8; CHECKSUM_SIZE];
    checksum.copy_from_slice(&data[total - CHECKSUM_SIZE..total]);

    Ok(Record {
        key,
        value,
        checksum,
    })
}

/// Verifies the trailing checksum of a frame.
///
/// # Errors
///
/// Returns [`CoreError::ChecksumMismatch`] (reported at `offset`, the frame's
/// position within its segment file) if the recomputed digest differs from
/// the stored one, or [`CoreError::Corrupt`] if the frame is too short.
pub fn verify(data: &[u8], offset: u64) -> CoreResult<()> {
    let total = frame_len(data)?;

    let digest = Sha1::digest(&data[..total - CHECKSUM_SIZE]);
    if digest.as_slice() != &data[total - CHECKSUM_SIZE..total] {
        return Err(CoreError::ChecksumMismatch { offset });
    }

    Ok(())
}

/// Parses and sanity-checks the declared frame length.
fn frame_len(data: &[u8]) -> CoreResult<usize> {
    if data.len() < HEADER_SIZE {
        return Err(CoreError::corrupt(format!(
            "frame header truncated: {} bytes",
            data.len()
        )));
    }

    let total = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if total < MIN_FRAME_SIZE {
        return Err(CoreError::corrupt(format!(
            "declared frame length {total} below minimum {MIN_FRAME_SIZE}"
        )));
    }
    if total > data.len() {
        return Err(CoreError::corrupt(format!(
            "declared frame length {total} exceeds available {} bytes",
            data.len()
        )));
    }

    Ok(total)
}
