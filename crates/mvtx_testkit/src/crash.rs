//! Crash recovery testing for the transaction store.
//!
//! Simulates crashes while snapshots are written and checks what a
//! restarted store recovers.
//!
//! ## Test Strategy
//!
//! 1. **Crash after checkpoint** - committed and checkpointed data survives
//! 2. **Crash before checkpoint** - work after the last snapshot is gone
//! 3. **Crash during snapshot write** - the torn record is dropped
//! 4. **Failed write, then retry** - a later snapshot still recovers
//! 5. **Crash with open transactions** - they come back and can finish
//!
//! ## Usage
//!
//! ```rust
//! use mvtx_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new();
//! harness.run_all_tests();
//! assert!(harness.all_passed(), "{}", harness.summary());
//! ```

use mvtx_core::{
    CoreError, InMemoryBackend, MvStore, StorageBackend, StoreConfig, TransactionStatus,
    TransactionStore,
};
use mvtx_storage::{StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const MAP: &str = "test";

#[derive(Debug)]
struct SwitchState {
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_next_append: AtomicBool,
    fail_on_sync: AtomicBool,
}

/// Remote control for a [`CrashableBackend`], usable after the backend
/// was handed to a store.
#[derive(Debug, Clone)]
pub struct CrashSwitch {
    state: Arc<SwitchState>,
}

impl Default for CrashSwitch {
    fn default() -> Self {
        Self {
            state: Arc::new(SwitchState {
                crash_after_bytes: AtomicUsize::new(usize::MAX),
                bytes_written: AtomicUsize::new(0),
                crashed: AtomicBool::new(false),
                fail_next_append: AtomicBool::new(false),
                fail_on_sync: AtomicBool::new(false),
            }),
        }
    }
}

impl CrashSwitch {
    /// Crashes once `bytes` more bytes have been written. An append that
    /// crosses the limit is cut short; a replace is dropped whole.
    pub fn crash_after(&self, bytes: usize) {
        let written = self.state.bytes_written.load(Ordering::SeqCst);
        self.state
            .crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Makes the next append fail without writing anything. The backend
    /// stays usable afterwards.
    pub fn fail_next_append(&self) {
        self.state.fail_next_append.store(true, Ordering::SeqCst);
    }

    /// Sets whether sync should crash.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.state.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Clears every armed failure and the crashed flag.
    pub fn reset(&self) {
        self.state.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.state.crashed.store(false, Ordering::SeqCst);
        self.state.fail_next_append.store(false, Ordering::SeqCst);
        self.state.fail_on_sync.store(false, Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Total bytes appended so far.
    pub fn bytes_written(&self) -> usize {
        self.state.bytes_written.load(Ordering::SeqCst)
    }
}

fn simulated(message: &str) -> StorageError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, message.to_string()))
}

/// A storage backend wrapper that can simulate crashes.
///
/// Once crashed, every mutating call fails, like a process that died: a
/// partially written record stays where it is.
#[derive(Debug)]
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    switch: CrashSwitch,
}

impl CrashableBackend {
    /// Creates a new crashable backend wrapping an inner backend.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            switch: CrashSwitch::default(),
        }
    }

    /// Returns the switch controlling this backend.
    pub fn switch(&self) -> CrashSwitch {
        self.switch.clone()
    }

    fn check_alive(&self) -> StorageResult<()> {
        if self.switch.has_crashed() {
            return Err(simulated("backend has crashed"));
        }
        Ok(())
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        self.check_alive()?;
        let state = &self.switch.state;
        if state.fail_next_append.swap(false, Ordering::SeqCst) {
            return Err(simulated("simulated write failure"));
        }

        let current = state.bytes_written.fetch_add(bytes.len(), Ordering::SeqCst);
        let threshold = state.crash_after_bytes.load(Ordering::SeqCst);
        if current.saturating_add(bytes.len()) > threshold {
            state.crashed.store(true, Ordering::SeqCst);
            let partial_len = threshold.saturating_sub(current).min(bytes.len());
            if partial_len > 0 {
                let _ = self.inner.append(&bytes[..partial_len]);
            }
            return Err(simulated("simulated crash during write"));
        }

        self.inner.append(bytes)
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_alive()?;
        if self.switch.state.fail_on_sync.load(Ordering::SeqCst) {
            self.switch.state.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated crash during sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check_alive()?;
        self.inner.truncate(new_size)
    }

    /// A crash before the replacement is complete leaves the old log.
    fn replace(&mut self, bytes: &[u8]) -> StorageResult<()> {
        self.check_alive()?;
        let state = &self.switch.state;
        let current = state.bytes_written.fetch_add(bytes.len(), Ordering::SeqCst);
        let threshold = state.crash_after_bytes.load(Ordering::SeqCst);
        if current.saturating_add(bytes.len()) > threshold {
            state.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated crash during replace"));
        }
        self.inner.replace(bytes)
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Expected visible keys after recovery.
    pub expected_keys: usize,
    /// Actual visible keys after recovery.
    pub actual_keys: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, keys: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_keys: keys,
            actual_keys: keys,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_keys: expected,
            actual_keys: actual,
            error: Some(error.to_string()),
        }
    }

    fn check(description: &str, expected: usize, actual: usize) -> Self {
        if expected == actual {
            Self::pass(description, actual)
        } else {
            Self::fail(description, expected, actual, "unexpected key count")
        }
    }
}

struct Session {
    ts: Arc<TransactionStore>,
    switch: CrashSwitch,
}

/// Test harness for crash recovery scenarios.
///
/// Each scenario runs over its own in-memory byte log; a "crash" drops
/// the store without closing it and the next session recovers from the
/// bytes that reached the log.
#[derive(Default)]
pub struct CrashRecoveryHarness {
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a new crash recovery harness.
    pub fn new() -> Self {
        Self::default()
    }

    fn session(log: &InMemoryBackend) -> Result<Session, CoreError> {
        let backend = CrashableBackend::new(Box::new(log.clone()));
        let switch = backend.switch();
        let store = MvStore::open(Box::new(backend), StoreConfig::default())?;
        let ts = TransactionStore::new(Arc::new(store))?;
        ts.init()?;
        Ok(Session { ts, switch })
    }

    fn put_committed(ts: &Arc<TransactionStore>, keys: std::ops::Range<i64>) -> Result<(), CoreError> {
        let tx = ts.begin()?;
        let map = tx.open_map::<i64, i64>(MAP)?;
        for key in keys {
            map.put(key, key * 10)?;
        }
        tx.commit()
    }

    fn visible_keys(ts: &Arc<TransactionStore>) -> Result<usize, CoreError> {
        let tx = ts.begin()?;
        let count = tx.open_map::<i64, i64>(MAP)?.size()?;
        tx.commit()?;
        Ok(count)
    }

    fn record(
        &mut self,
        description: &str,
        expected: usize,
        scenario: impl FnOnce() -> Result<usize, CoreError>,
    ) -> CrashRecoveryResult {
        let result = match scenario() {
            Ok(actual) => CrashRecoveryResult::check(description, expected, actual),
            Err(e) => CrashRecoveryResult::fail(description, expected, 0, &e.to_string()),
        };
        self.results.push(result.clone());
        result
    }

    /// Tests that committed, checkpointed data survives a crash.
    pub fn test_committed_data_survives(&mut self) -> CrashRecoveryResult {
        self.record("Committed data survives crash", 10, || {
            let log = InMemoryBackend::new();
            {
                let s = Self::session(&log)?;
                Self::put_committed(&s.ts, 0..10)?;
                s.ts.store().commit()?;
            }
            let s = Self::session(&log)?;
            Self::visible_keys(&s.ts)
        })
    }

    /// Tests that work after the last checkpoint is discarded.
    pub fn test_unsaved_data_discarded(&mut self) -> CrashRecoveryResult {
        self.record("Work after the last checkpoint is discarded", 5, || {
            let log = InMemoryBackend::new();
            {
                let s = Self::session(&log)?;
                Self::put_committed(&s.ts, 0..5)?;
                s.ts.store().commit()?;
                Self::put_committed(&s.ts, 5..10)?;
            }
            let s = Self::session(&log)?;
            Self::visible_keys(&s.ts)
        })
    }

    /// Tests that a snapshot torn by a crash is dropped on reopen.
    pub fn test_torn_snapshot(&mut self) -> CrashRecoveryResult {
        self.record("Torn snapshot falls back to the previous one", 3, || {
            let log = InMemoryBackend::new();
            let before;
            {
                let s = Self::session(&log)?;
                Self::put_committed(&s.ts, 0..3)?;
                s.ts.store().commit()?;
                before = log.data().len();
                Self::put_committed(&s.ts, 3..8)?;
                s.switch.crash_after(16);
                if s.ts.store().commit().is_ok() || !s.switch.has_crashed() {
                    return Err(CoreError::invalid_operation("crash was not simulated"));
                }
            }
            if log.data().len() != before + 16 {
                return Err(CoreError::invalid_operation("no partial record was written"));
            }
            let s = Self::session(&log)?;
            if log.data().len() != before {
                return Err(CoreError::invalid_operation("torn tail was not truncated"));
            }
            Self::visible_keys(&s.ts)
        })
    }

    /// Tests that a failed snapshot write does not hide a later one.
    pub fn test_failed_write_then_retry(&mut self) -> CrashRecoveryResult {
        self.record("Snapshot after a failed write recovers", 6, || {
            let log = InMemoryBackend::new();
            {
                let s = Self::session(&log)?;
                Self::put_committed(&s.ts, 0..6)?;
                s.switch.fail_next_append();
                if s.ts.store().commit().is_ok() {
                    return Err(CoreError::invalid_operation("write failure was not simulated"));
                }
                s.ts.store().commit()?;
            }
            let s = Self::session(&log)?;
            Self::visible_keys(&s.ts)
        })
    }

    /// Tests that a crash while compacting the log keeps the old log.
    pub fn test_interrupted_compaction(&mut self) -> CrashRecoveryResult {
        self.record("Crash during compaction keeps the old log", 7, || {
            let log = InMemoryBackend::new();
            let before;
            {
                let s = Self::session(&log)?;
                Self::put_committed(&s.ts, 0..4)?;
                s.ts.store().commit()?;
                Self::put_committed(&s.ts, 4..7)?;
                s.ts.store().commit()?;
                before = log.data();
                s.switch.crash_after(8);
                if s.ts.store().compact().is_ok() || !s.switch.has_crashed() {
                    return Err(CoreError::invalid_operation("crash was not simulated"));
                }
            }
            if log.data() != before {
                return Err(CoreError::invalid_operation("old log was modified"));
            }
            {
                let s = Self::session(&log)?;
                s.ts.store().compact()?;
            }
            if log.data().len() >= before.len() {
                return Err(CoreError::invalid_operation("log was not compacted"));
            }
            let s = Self::session(&log)?;
            Self::visible_keys(&s.ts)
        })
    }

    /// Tests that open and prepared transactions come back after a crash:
    /// the prepared one commits, the open one rolls back.
    pub fn test_in_flight_transactions(&mut self) -> CrashRecoveryResult {
        self.record("In-flight transactions are recovered", 4, || {
            let log = InMemoryBackend::new();
            {
                let s = Self::session(&log)?;
                Self::put_committed(&s.ts, 0..2)?;

                let prepared = s.ts.begin()?;
                prepared.open_map::<i64, i64>(MAP)?.put(2, 20)?;
                prepared.open_map::<i64, i64>(MAP)?.put(3, 30)?;
                prepared.prepare()?;

                let open = s.ts.begin()?;
                let map = open.open_map::<i64, i64>(MAP)?;
                map.remove(&0)?;
                map.put(9, 90)?;
                s.ts.store().commit()?;
            }

            let s = Self::session(&log)?;
            let mut recovered = s.ts.get_open_transactions();
            if recovered.len() != 2 || Self::visible_keys(&s.ts)? != 2 {
                return Err(CoreError::invalid_operation("open transactions not recovered"));
            }
            for tx in recovered.drain(..) {
                match tx.status() {
                    TransactionStatus::Prepared => tx.commit()?,
                    _ => tx.rollback()?,
                }
            }
            Self::visible_keys(&s.ts)
        })
    }

    /// Runs all crash recovery tests.
    pub fn run_all_tests(&mut self) -> Vec<CrashRecoveryResult> {
        self.results.clear();

        self.test_committed_data_survives();
        self.test_unsaved_data_discarded();
        self.test_torn_snapshot();
        self.test_failed_write_then_retry();
        self.test_in_flight_transactions();
        self.test_interrupted_compaction();

        self.results.clone()
    }

    /// Returns a summary of test results.
    pub fn summary(&self) -> String {
        let passed = self.results.iter().filter(|r| r.passed).count();
        let total = self.results.len();

        let mut summary = format!(
            "\n=== Crash Recovery Test Summary ===\n\
             Passed: {}/{}\n\n",
            passed, total
        );

        for result in &self.results {
            let status = if result.passed { "ok" } else { "FAILED" };
            summary.push_str(&format!(
                "[{}] {}\n  Expected: {} keys, Actual: {} keys\n",
                status, result.description, result.expected_keys, result.actual_keys
            ));
            if let Some(ref error) = result.error {
                summary.push_str(&format!("  Error: {}\n", error));
            }
        }

        summary
    }

    /// Returns whether all tests passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}
