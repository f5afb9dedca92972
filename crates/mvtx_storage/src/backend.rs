//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};

/// An append-only byte log used to persist map store snapshots.
///
/// # Invariants
///
/// - `append` returns the offset the data starts at, which equals the
///   previous `size()`
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `sync` returns, all appended bytes survive process termination
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadPastEnd`] if the range is not fully
    /// inside the log, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Returns the current log length in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Makes all appended data durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Discards everything after `new_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is larger than the current size or
    /// the truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole log with `data` and makes it durable.
    ///
    /// After a failure or a crash the log holds either its old contents or
    /// exactly `data`, never a mix.
    ///
    /// # Errors
    ///
    /// Returns an error if the new contents cannot be written; the old log
    /// is left in place.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads the whole log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| StorageError::TooLarge { size })?;
        self.read_at(0, len)
    }
}

pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> StorageResult<()> {
    let end = offset.saturating_add(len as u64);
    if offset > size || end > size {
        return Err(StorageError::ReadPastEnd { offset, len, size });
    }
    Ok(())
}

pub(crate) fn check_truncate(new_size: u64, size: u64) -> StorageResult<()> {
    if new_size > size {
        return Err(StorageError::InvalidTruncate {
            requested: new_size,
            size,
        });
    }
    Ok(())
}
