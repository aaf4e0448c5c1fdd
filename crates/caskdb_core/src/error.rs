//! Error types for the CaskDB engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in CaskDB engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key absent from every segment's index.
    #[error("record does not exist")]
    NotFound,

    /// A record frame is malformed or otherwise unreadable.
    #[error("corrupt record: {message}")]
    Corrupt {
        /// Description of the corruption.
        message: String,
    },

    /// A record's stored checksum does not match recomputation.
    #[error("checksum mismatch at offset {offset}")]
    ChecksumMismatch {
        /// Byte offset of the record within its segment file.
        offset: u64,
    },

    /// A record would never fit in a segment of the configured size.
    #[error("record of {size} bytes exceeds the {limit} byte segment limit")]
    RecordTooLarge {
        /// Encoded size of the offending record.
        size: u64,
        /// Configured maximum segment size.
        limit: u64,
    },

    /// The engine has been closed and its workers are gone.
    #[error("engine is closed")]
    Closed,
}

impl CoreError {
    /// Creates a corrupt record error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Returns true for errors that make a single read fail without
    /// implicating the rest of the store.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::ChecksumMismatch { .. })
    }

    /// Returns true if the error is a missing-key lookup result.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Returns true if the error is an I/O failure caused by a file that
    /// no longer exists (a segment deleted by a concurrent compaction swap).
    pub(crate) fn is_vanished_file(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}
