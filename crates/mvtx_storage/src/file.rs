//! File-based storage backend.

use crate::backend::{check_range, check_truncate, StorageBackend};
use crate::error::StorageResult;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A byte log stored in a single file.
///
/// `sync` calls `File::sync_all`, so a snapshot appended and synced before a
/// crash is visible when the file is reopened.
///
/// ```no_run
/// use mvtx_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("store.mvtx")).unwrap();
/// backend.append(b"snapshot").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens or creates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileState { file, size }),
        })
    }

    /// Like [`FileBackend::open`], creating missing parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories or the file cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".compact");
        self.path.with_file_name(name)
    }

    /// Fsyncs the directory holding the file so a rename is durable.
    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.inner.lock();
        check_range(offset, len, state.size)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; len];
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let state = self.inner.get_mut();
        let offset = state.size;
        if data.is_empty() {
            return Ok(offset);
        }

        state.file.seek(SeekFrom::End(0))?;
        state.file.write_all(data)?;
        state.size += data.len() as u64;
        Ok(offset)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let state = self.inner.get_mut();
        state.file.flush()?;
        state.file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let state = self.inner.get_mut();
        check_truncate(new_size, state.size)?;
        state.file.set_len(new_size)?;
        state.file.sync_all()?;
        state.size = new_size;
        Ok(())
    }

    /// Writes `data` to a sibling file, syncs it and renames it over the log.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let temp_path = self.temp_path();
        let written = (|| -> StorageResult<()> {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(data)?;
            temp.sync_all()?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        fs::rename(&temp_path, &self.path)?;
        self.sync_directory()?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        *self.inner.get_mut() = FileState {
            file,
            size: data.len() as u64,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;
    use tempfile::tempdir;

    #[test]
    fn create_append_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mvtx");

        let mut backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
        assert!(matches!(
            backend.read_at(8, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.mvtx");

        {
            let mut backend = FileBackend::open_with_create_dirs(&path).unwrap();
            backend.append(b"persistent").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"persistent");
    }

    #[test]
    fn truncate_shrinks_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mvtx");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"0123456789").unwrap();
        backend.truncate(4).unwrap();
        assert_eq!(backend.read_all().unwrap(), b"0123");
        assert!(matches!(
            backend.truncate(40),
            Err(StorageError::InvalidTruncate { .. })
        ));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4);
    }

    #[test]
    fn replace_swaps_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mvtx");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"old old old").unwrap();
        backend.replace(b"new").unwrap();
        assert_eq!(backend.size().unwrap(), 3);
        assert_eq!(backend.append(b"er").unwrap(), 3);
        assert_eq!(backend.read_all().unwrap(), b"newer");
        assert!(!dir.path().join("store.mvtx.compact").exists());

        drop(backend);
        let reopened = FileBackend::open(&path).unwrap();
        assert_eq!(reopened.read_all().unwrap(), b"newer");
    }
}
