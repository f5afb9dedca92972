//! Transaction handles and their arena slots.

use crate::error::{CoreError, CoreResult};
use crate::mvstore::MvMap;
use crate::tx::map::TransactionMap;
use crate::tx::store::TransactionStore;
use crate::tx::undo::{Changes, UndoLogRecord};
use crate::types::TransactionId;
use mvtx_codec::ValueType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    /// The handle's transaction has ended and its id was reused.
    Closed = 0,
    /// Active; reads and writes are allowed.
    Open = 1,
    /// First phase of a two-phase commit is done; only commit or rollback
    /// may follow.
    Prepared = 2,
    /// Commit in progress; other transactions already see its writes.
    Committing = 3,
    /// Committed.
    Committed = 4,
    /// Rollback in progress.
    RollingBack = 5,
    /// Rolled back.
    RolledBack = 6,
}

impl TransactionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::Prepared,
            3 => Self::Committing,
            4 => Self::Committed,
            5 => Self::RollingBack,
            6 => Self::RolledBack,
            _ => Self::Closed,
        }
    }

    /// Returns true while the transaction has not finished.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Open | Self::Prepared | Self::Committing | Self::RollingBack
        )
    }

    /// Whether a transaction in this state blocks writers of its keys.
    pub(crate) const fn holds_locks(self) -> bool {
        matches!(self, Self::Open | Self::Prepared | Self::RollingBack)
    }

    /// Whether others see the pending values of a transaction in this
    /// state. Closed covers cells whose writer no longer exists.
    pub(crate) const fn exposes_pending(self) -> bool {
        matches!(self, Self::Committing | Self::Committed | Self::Closed)
    }
}

/// Persisted row of the transaction meta map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TxMeta {
    pub(crate) status: TransactionStatus,
    pub(crate) name: Option<String>,
}

/// Arena entry for one transaction id, reused by every transaction that
/// gets that id. The generation tells handles of earlier users apart.
pub(crate) struct TxnSlot {
    pub(crate) id: TransactionId,
    pub(crate) undo: Arc<MvMap<UndoLogRecord>>,
    generation: AtomicU64,
    status: AtomicU8,
    log_id: AtomicU64,
    name: Mutex<Option<String>>,
}

impl TxnSlot {
    pub(crate) fn new(id: TransactionId, undo: Arc<MvMap<UndoLogRecord>>) -> Self {
        Self {
            id,
            undo,
            generation: AtomicU64::new(0),
            status: AtomicU8::new(TransactionStatus::Closed as u8),
            log_id: AtomicU64::new(0),
            name: Mutex::new(None),
        }
    }

    /// Hands the slot to a new transaction and returns its generation.
    pub(crate) fn reset(
        &self,
        status: TransactionStatus,
        name: Option<String>,
        log_id: u64,
    ) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.name.lock() = name;
        self.log_id.store(log_id, Ordering::Release);
        self.status.store(status as u8, Ordering::Release);
        generation
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TransactionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn log_id(&self) -> u64 {
        self.log_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_log_id(&self, log_id: u64) {
        self.log_id.store(log_id, Ordering::Release);
    }

    pub(crate) fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: Option<String>) {
        *self.name.lock() = name;
    }

    pub(crate) fn meta(&self) -> TxMeta {
        TxMeta {
            status: self.status(),
            name: self.name(),
        }
    }
}

/// A handle to a transaction.
///
/// Handles are cheap to clone and can be sent to other threads, but a
/// transaction is meant to be driven by one thread at a time. Once the
/// transaction has ended and its id was given to a new transaction, the
/// handle reports [`TransactionStatus::Closed`] and its operations fail
/// with [`CoreError::TransactionClosed`].
#[derive(Clone)]
pub struct Transaction {
    store: Arc<TransactionStore>,
    slot: Arc<TxnSlot>,
    generation: u64,
}

impl Transaction {
    pub(crate) fn new(store: Arc<TransactionStore>, slot: Arc<TxnSlot>) -> Self {
        let generation = slot.generation();
        Self {
            store,
            slot,
            generation,
        }
    }

    pub(crate) fn slot(&self) -> &TxnSlot {
        &self.slot
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.slot.id
    }

    /// Returns the store this transaction belongs to.
    #[must_use]
    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    fn is_current(&self) -> bool {
        self.slot.generation() == self.generation
    }

    pub(crate) fn check_current(&self) -> CoreResult<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(CoreError::TransactionClosed { id: self.id() })
        }
    }

    /// Fails unless the transaction may still write.
    pub(crate) fn check_writable(&self) -> CoreResult<()> {
        self.store.store().ensure_open()?;
        self.check_current()?;
        match self.slot.status() {
            TransactionStatus::Open => Ok(()),
            TransactionStatus::Prepared => Err(CoreError::invalid_operation(format!(
                "transaction {} is prepared",
                self.id()
            ))),
            status => Err(CoreError::invalid_operation(format!(
                "transaction {} is {status:?}",
                self.id()
            ))),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        if self.is_current() {
            self.slot.status()
        } else {
            TransactionStatus::Closed
        }
    }

    /// Returns the transaction name.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        if self.is_current() {
            self.slot.name()
        } else {
            None
        }
    }

    /// Names the transaction. The name is persisted and survives restart.
    ///
    /// # Errors
    ///
    /// Fails if the transaction has ended.
    pub fn set_name(&self, name: impl Into<String>) -> CoreResult<()> {
        self.store.set_name(self, name.into())
    }

    /// Number of undo records, which is also the current savepoint.
    #[must_use]
    pub fn log_id(&self) -> u64 {
        if self.is_current() {
            self.slot.log_id()
        } else {
            0
        }
    }

    /// Returns true if the transaction has written anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.log_id() > 0
    }

    /// Returns a marker for [`Transaction::rollback_to_savepoint`].
    #[must_use]
    pub fn set_savepoint(&self) -> u64 {
        self.log_id()
    }

    /// Reverts every write made after `savepoint` was taken.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not open or the marker is ahead of the
    /// log.
    pub fn rollback_to_savepoint(&self, savepoint: u64) -> CoreResult<()> {
        self.store.rollback_to_savepoint(self, savepoint)
    }

    /// Opens a view of the map called `name`, creating the map if needed.
    ///
    /// # Errors
    ///
    /// Fails for names reserved by the transaction layer, or if the store or
    /// transaction is closed.
    pub fn open_map<K: ValueType, V: ValueType>(
        &self,
        name: &str,
    ) -> CoreResult<TransactionMap<K, V>> {
        self.check_current()?;
        let map = self.store.open_data_map(name)?;
        Ok(TransactionMap::new(self.clone(), map))
    }

    /// Moves the transaction to [`TransactionStatus::Prepared`] and flushes
    /// the store, so a restart finds it prepared.
    ///
    /// # Errors
    ///
    /// Fails unless the transaction is open, or if the flush fails.
    pub fn prepare(&self) -> CoreResult<()> {
        self.store.prepare(self)
    }

    /// Makes every write of the transaction permanent.
    ///
    /// If a write cannot be published the transaction stays
    /// [`TransactionStatus::Committing`], keeping its id and undo log, and
    /// `commit` may be called again.
    ///
    /// # Errors
    ///
    /// Fails unless the transaction is open, prepared or committing, or if
    /// a write cannot be published.
    pub fn commit(&self) -> CoreResult<()> {
        self.store.commit(self)
    }

    /// Reverts every write of the transaction.
    ///
    /// # Errors
    ///
    /// Fails unless the transaction is open or prepared.
    pub fn rollback(&self) -> CoreResult<()> {
        self.store.rollback(self)
    }

    /// Returns the changes made after `savepoint`, most recent first.
    ///
    /// # Errors
    ///
    /// Fails if the transaction has ended and its id was reused.
    pub fn get_changes(&self, savepoint: u64) -> CoreResult<Changes> {
        self.check_current()?;
        Ok(Changes::new(
            Arc::clone(self.store.store()),
            Arc::clone(&self.slot.undo),
            self.slot.log_id(),
            savepoint,
        ))
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("name", &self.name())
            .field("log_id", &self.log_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            TransactionStatus::Closed,
            TransactionStatus::Open,
            TransactionStatus::Prepared,
            TransactionStatus::Committing,
            TransactionStatus::Committed,
            TransactionStatus::RollingBack,
            TransactionStatus::RolledBack,
        ] {
            assert_eq!(TransactionStatus::from_u8(status as u8), status);
        }
        assert_eq!(TransactionStatus::from_u8(200), TransactionStatus::Closed);
    }

    #[test]
    fn lock_and_visibility_classes() {
        assert!(TransactionStatus::Prepared.holds_locks());
        assert!(TransactionStatus::RollingBack.holds_locks());
        assert!(!TransactionStatus::Committing.holds_locks());
        assert!(TransactionStatus::Committing.exposes_pending());
        assert!(!TransactionStatus::RolledBack.exposes_pending());
        assert!(!TransactionStatus::Open.exposes_pending());
        assert!(!TransactionStatus::Committed.is_active());
    }

    #[test]
    fn slot_reset_bumps_generation() {
        let store = crate::mvstore::MvStore::in_memory();
        let undo = store.open_map::<UndoLogRecord>("_tx.undo.1").unwrap();
        let slot = TxnSlot::new(TransactionId::new(1), undo);
        assert_eq!(slot.status(), TransactionStatus::Closed);
        let first = slot.reset(TransactionStatus::Open, Some("a".into()), 0);
        let second = slot.reset(TransactionStatus::Prepared, None, 3);
        assert_eq!(second, first + 1);
        assert_eq!(slot.status(), TransactionStatus::Prepared);
        assert_eq!(slot.log_id(), 3);
        assert!(slot.name().is_none());
    }
}
