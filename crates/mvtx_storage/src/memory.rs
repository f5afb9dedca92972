//! In-memory storage backend.

use crate::backend::{check_range, check_truncate, StorageBackend};
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory byte log.
///
/// Clones share the same buffer. Handing a clone to a second store after the
/// first one is closed is how tests reopen an in-memory database.
///
/// ```rust
/// use mvtx_storage::{StorageBackend, InMemoryBackend};
///
/// let mut first = InMemoryBackend::new();
/// let second = first.clone();
/// first.append(b"abc").unwrap();
/// assert_eq!(second.size().unwrap(), 3);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the buffer.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Overwrites one byte, for corruption tests.
    pub fn corrupt_byte(&self, offset: usize) {
        let mut data = self.data.write();
        if let Some(byte) = data.get_mut(offset) {
            *byte ^= 0xFF;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        check_range(offset, len, data.len() as u64)?;
        let start = offset as usize;
        Ok(data[start..start + len].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        check_truncate(new_size, data.len() as u64)?;
        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> StorageResult<()> {
        *self.data.write() = bytes.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    #[test]
    fn append_returns_previous_size() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_all().unwrap(), b"hello world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(backend.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn clones_share_buffer() {
        let mut writer = InMemoryBackend::new();
        let reader = writer.clone();
        writer.append(b"shared").unwrap();
        assert_eq!(reader.read_all().unwrap(), b"shared");
    }

    #[test]
    fn truncate_and_corrupt() {
        let mut backend = InMemoryBackend::with_data(b"abcdef".to_vec());
        backend.truncate(3).unwrap();
        assert_eq!(backend.data(), b"abc");
        assert!(backend.truncate(10).is_err());

        backend.corrupt_byte(0);
        assert_ne!(backend.data()[0], b'a');
    }

    #[test]
    fn replace_is_seen_by_clones() {
        let mut backend = InMemoryBackend::with_data(b"abcdef".to_vec());
        let other = backend.clone();
        backend.replace(b"xy").unwrap();
        assert_eq!(other.data(), b"xy");
    }
}
