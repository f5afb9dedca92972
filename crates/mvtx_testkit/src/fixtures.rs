//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up transaction stores,
//! reopening them to simulate a restart, and common test scenarios.

use mvtx_core::{
    FileBackend, InMemoryBackend, MvStore, StorageBackend, StoreConfig, TransactionConfig,
    TransactionStore,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// Filtering follows `RUST_LOG`. Calling it more than once is harmless.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

enum Location {
    Memory(InMemoryBackend),
    File {
        path: PathBuf,
        _temp_dir: TempDir,
    },
}

/// A transaction store over a backend that outlives it.
///
/// [`TestStore::reopen`] drops the current store without closing it and
/// opens a new one over the same bytes, which is what a process restart
/// looks like to the store.
pub struct TestStore {
    /// The transaction store, initialized.
    pub ts: Arc<TransactionStore>,
    location: Location,
    config: TransactionConfig,
}

impl TestStore {
    /// Creates an in-memory test store.
    pub fn memory() -> Self {
        Self::memory_with(TransactionConfig::default())
    }

    /// Creates an in-memory test store with the given configuration.
    pub fn memory_with(config: TransactionConfig) -> Self {
        let backend = InMemoryBackend::new();
        let ts = open_ts(Box::new(backend.clone()), config.clone());
        Self {
            ts,
            location: Location::Memory(backend),
            config,
        }
    }

    /// Creates a file-based test store in a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("data").join("store.mvtx");
        let config = TransactionConfig::default();
        let ts = open_ts(Box::new(open_file(&path)), config.clone());
        Self {
            ts,
            location: Location::File {
                path,
                _temp_dir: temp_dir,
            },
            config,
        }
    }

    /// Returns the store file path if file-based, `None` if in-memory.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::Memory(_) => None,
            Location::File { path, .. } => Some(path),
        }
    }

    /// Returns the persisted bytes.
    pub fn bytes(&self) -> Vec<u8> {
        match &self.location {
            Location::Memory(backend) => backend.data(),
            Location::File { path, .. } => std::fs::read(path).expect("Failed to read store file"),
        }
    }

    /// Writes a snapshot of the current state.
    pub fn checkpoint(&self) {
        self.ts.store().commit().expect("Failed to commit store");
    }

    /// Simulates a restart: forgets the in-memory state and recovers from
    /// whatever was last committed to the backend.
    pub fn reopen(&mut self) {
        let backend: Box<dyn StorageBackend> = match &self.location {
            Location::Memory(backend) => Box::new(backend.clone()),
            Location::File { path, .. } => Box::new(open_file(path)),
        };
        self.ts = open_ts(backend, self.config.clone());
    }

    /// Closes the store cleanly, then reopens it.
    pub fn close_and_reopen(&mut self) {
        self.ts.close().expect("Failed to close store");
        self.reopen();
    }
}

impl std::ops::Deref for TestStore {
    type Target = Arc<TransactionStore>;

    fn deref(&self) -> &Self::Target {
        &self.ts
    }
}

fn open_file(path: &Path) -> FileBackend {
    FileBackend::open_with_create_dirs(path).expect("Failed to open file backend")
}

fn open_ts(backend: Box<dyn StorageBackend>, config: TransactionConfig) -> Arc<TransactionStore> {
    let store = MvStore::open(backend, StoreConfig::default()).expect("Failed to open store");
    let ts = TransactionStore::with_config(Arc::new(store), config)
        .expect("Failed to create transaction store");
    ts.init().expect("Failed to initialize transaction store");
    ts
}

/// Runs a test with a temporary in-memory transaction store.
///
/// # Example
///
/// ```rust
/// use mvtx_testkit::with_store;
///
/// with_store(|ts| {
///     let tx = ts.begin().unwrap();
///     tx.open_map::<i64, i64>("test").unwrap().put(1, 1).unwrap();
///     tx.commit().unwrap();
/// });
/// ```
pub fn with_store<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<TransactionStore>) -> R,
{
    let store = TestStore::memory();
    f(&store.ts)
}

/// Runs a test with a temporary file-based transaction store.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<TransactionStore>, &Path) -> R,
{
    let store = TestStore::file();
    let path = store.path().expect("File store should have a path");
    f(&store.ts, path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a store whose map `name` holds `i -> i * 10` for every
    /// `i` in `0..count`, committed.
    pub fn populated_store(name: &str, count: i64) -> TestStore {
        let store = TestStore::memory();
        let tx = store.begin().expect("Failed to begin transaction");
        let map = tx
            .open_map::<i64, i64>(name)
            .expect("Failed to open map");
        for i in 0..count {
            map.put(i, i * 10).expect("Failed to put");
        }
        tx.commit().expect("Failed to commit");
        store
    }

    /// Creates a store with `count` maps named `map0`, `map1`, ...,
    /// each holding one committed key.
    pub fn multi_map_store(count: usize) -> (TestStore, Vec<String>) {
        let store = TestStore::memory();
        let names: Vec<String> = (0..count).map(|i| format!("map{i}")).collect();
        let tx = store.begin().expect("Failed to begin transaction");
        for name in &names {
            tx.open_map::<String, String>(name)
                .expect("Failed to open map")
                .put("key".to_string(), name.clone())
                .expect("Failed to put");
        }
        tx.commit().expect("Failed to commit");
        (store, names)
    }
}
