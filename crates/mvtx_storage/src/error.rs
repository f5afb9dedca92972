//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the log.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current log size.
        size: u64,
    },

    /// Truncation target lies past the end of the log.
    #[error("cannot truncate to {requested} bytes, log is only {size} bytes")]
    InvalidTruncate {
        /// The requested size.
        requested: u64,
        /// The current log size.
        size: u64,
    },

    /// The log does not fit in memory on this platform.
    #[error("storage of {size} bytes cannot be addressed")]
    TooLarge {
        /// The log size.
        size: u64,
    },
}
