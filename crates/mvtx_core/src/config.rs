//! Store and transaction configuration.

use crate::types::MAX_OPEN_TRANSACTIONS;
use std::time::Duration;

/// Configuration for opening a map store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to sync the backend after every snapshot.
    pub sync_on_commit: bool,

    /// Whether to fail on a trailing snapshot record that does not pass its
    /// checksum instead of falling back to the previous one.
    pub strict_recovery: bool,

    /// Once the snapshots older than the newest one take at least this many
    /// bytes, the log is rewritten down to the newest snapshot. Zero turns
    /// compaction off.
    pub compact_threshold: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            strict_recovery: false,
            compact_threshold: 4 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to sync the backend after every snapshot.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether a damaged trailing snapshot is an error.
    #[must_use]
    pub const fn strict_recovery(mut self, value: bool) -> Self {
        self.strict_recovery = value;
        self
    }

    /// Sets how many bytes of older snapshots trigger compaction.
    #[must_use]
    pub const fn compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }
}

/// Configuration for a transaction store.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Largest transaction id handed out; also the open transaction limit.
    pub max_transaction_id: u32,

    /// How long a blocking write waits for a lock before failing with
    /// `Locked`. `None` waits until the holder ends or a deadlock is found.
    pub lock_timeout: Option<Duration>,

    /// Upper bound on a single park while waiting for a lock. The deadlock
    /// check and the timeout are re-evaluated after every slice.
    pub wait_slice: Duration,

    /// Whether every transaction commit also writes a store snapshot.
    pub flush_on_commit: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_transaction_id: MAX_OPEN_TRANSACTIONS,
            lock_timeout: None,
            wait_slice: Duration::from_millis(10),
            flush_on_commit: false,
        }
    }
}

impl TransactionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the largest transaction id.
    #[must_use]
    pub const fn max_transaction_id(mut self, value: u32) -> Self {
        self.max_transaction_id = value;
        self
    }

    /// Sets the lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, value: Option<Duration>) -> Self {
        self.lock_timeout = value;
        self
    }

    /// Sets the park slice used while waiting for a lock.
    #[must_use]
    pub const fn wait_slice(mut self, value: Duration) -> Self {
        self.wait_slice = value;
        self
    }

    /// Sets whether transaction commits write a store snapshot.
    #[must_use]
    pub const fn flush_on_commit(mut self, value: bool) -> Self {
        self.flush_on_commit = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let store = StoreConfig::default();
        assert!(store.sync_on_commit);
        assert!(!store.strict_recovery);
        assert_eq!(store.compact_threshold, 4 * 1024 * 1024);

        let tx = TransactionConfig::default();
        assert_eq!(tx.max_transaction_id, MAX_OPEN_TRANSACTIONS);
        assert!(tx.lock_timeout.is_none());
        assert!(!tx.flush_on_commit);
    }

    #[test]
    fn builder_pattern() {
        let config = TransactionConfig::new()
            .max_transaction_id(16)
            .lock_timeout(Some(Duration::ZERO))
            .wait_slice(Duration::from_millis(1))
            .flush_on_commit(true);

        assert_eq!(config.max_transaction_id, 16);
        assert_eq!(config.lock_timeout, Some(Duration::ZERO));
        assert_eq!(config.wait_slice, Duration::from_millis(1));
        assert!(config.flush_on_commit);

        let store = StoreConfig::new()
            .sync_on_commit(false)
            .strict_recovery(true)
            .compact_threshold(0);
        assert!(!store.sync_on_commit);
        assert!(store.strict_recovery);
        assert_eq!(store.compact_threshold, 0);
    }
}
