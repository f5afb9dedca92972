//! The transaction store: id allocation, locking, commit and rollback.

use crate::config::TransactionConfig;
use crate::error::{CoreError, CoreResult};
use crate::mvstore::{MvMap, MvStore};
use crate::tx::deadlock::WaitForGraph;
use crate::tx::transaction::{Transaction, TransactionStatus, TxMeta, TxnSlot};
use crate::tx::undo::{
    log_key, undo_map_name, UndoLogRecord, META_MAP_NAME, RESERVED_PREFIX, UNDO_MAP_PREFIX,
};
use crate::tx::versioned::VersionedValue;
use crate::types::{MapId, OperationId, TransactionId, MAX_OPEN_TRANSACTIONS};
use mvtx_codec::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Whether a write may park on a key held by another transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Wait,
    NoWait,
}

/// What a write does with the value it found.
#[derive(Debug)]
pub(crate) enum Decision {
    /// Install this tentative value; `None` deletes.
    Set(Option<Value>),
    /// Take the lock, keeping the visible value.
    Lock,
    /// Leave the key alone.
    Keep,
}

#[derive(Debug)]
pub(crate) enum WriteOutcome {
    Applied { previous: Option<Value> },
    Unchanged { current: Option<Value> },
    Locked,
}

impl WriteOutcome {
    /// The value visible to the writer before the call.
    pub(crate) fn previous(self) -> Option<Value> {
        match self {
            Self::Applied { previous } => previous,
            Self::Unchanged { current } => current,
            Self::Locked => None,
        }
    }
}

#[derive(Debug, Default)]
struct OpenSet {
    live: BTreeSet<u32>,
    last_id: u32,
}

impl OpenSet {
    /// First free id after the last one handed out, wrapping at `max`.
    fn next_free(&self, max: u32) -> Option<u32> {
        let start = if self.last_id >= max { 0 } else { self.last_id };
        (start + 1..=max)
            .chain(1..=start)
            .find(|id| !self.live.contains(id))
    }
}

#[derive(Debug, Default)]
struct RecoveredTransaction {
    log_id: u64,
    meta: Option<TxMeta>,
}

fn meta_key(id: TransactionId) -> Value {
    Value::Integer(i64::from(id.as_u32()))
}

/// Coordinates all transactions over one [`MvStore`].
///
/// The store hands out transaction ids, keeps every open transaction's
/// undo log in a map of the underlying store, resolves commits and
/// rollbacks, and parks writers that hit a key locked by another
/// transaction. Transaction status and undo logs are ordinary maps, so
/// whatever the underlying store persisted is picked up again by
/// [`TransactionStore::init`].
///
/// # Example
///
/// ```
/// use mvtx_core::{MvStore, TransactionStore};
/// use std::sync::Arc;
///
/// let ts = TransactionStore::new(Arc::new(MvStore::in_memory())).unwrap();
/// ts.init().unwrap();
///
/// let tx = ts.begin().unwrap();
/// let map = tx.open_map::<String, String>("greetings").unwrap();
/// map.put("en".into(), "hello".into()).unwrap();
/// tx.commit().unwrap();
/// ```
pub struct TransactionStore {
    store: Arc<MvStore>,
    config: TransactionConfig,
    meta: Arc<MvMap<TxMeta>>,
    /// Indexed by transaction id, grown on demand.
    slots: RwLock<Vec<Option<Arc<TxnSlot>>>>,
    open: Mutex<OpenSet>,
    max_transaction_id: AtomicU32,
    waits: WaitForGraph,
    initialized: AtomicBool,
}

impl TransactionStore {
    /// Creates a transaction store with the default configuration.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed or its meta map cannot be opened.
    pub fn new(store: Arc<MvStore>) -> CoreResult<Arc<Self>> {
        Self::with_config(store, TransactionConfig::default())
    }

    /// Creates a transaction store.
    ///
    /// [`TransactionStore::init`] must run before the first
    /// [`TransactionStore::begin`].
    ///
    /// # Errors
    ///
    /// Fails if `max_transaction_id` is out of range, the store is closed,
    /// or its meta map cannot be opened.
    pub fn with_config(store: Arc<MvStore>, config: TransactionConfig) -> CoreResult<Arc<Self>> {
        check_max_transaction_id(config.max_transaction_id)?;
        let meta = store.open_map::<TxMeta>(META_MAP_NAME)?;
        Ok(Arc::new(Self {
            max_transaction_id: AtomicU32::new(config.max_transaction_id),
            store,
            config,
            meta,
            slots: RwLock::new(Vec::new()),
            open: Mutex::new(OpenSet::default()),
            waits: WaitForGraph::default(),
            initialized: AtomicBool::new(false),
        }))
    }

    /// Returns the underlying map store.
    #[must_use]
    pub fn store(&self) -> &Arc<MvStore> {
        &self.store
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Rebuilds the set of open transactions from the persisted undo logs
    /// and transaction metadata. Calling it again is a no-op.
    ///
    /// Recovered transactions come back `Open`, `Prepared` or `Committing`;
    /// the caller decides whether to commit or roll them back.
    ///
    /// # Errors
    ///
    /// Fails on a closed store or malformed transaction maps.
    pub fn init(&self) -> CoreResult<()> {
        self.store.ensure_open()?;
        let mut open = self.open.lock();
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut recovered: BTreeMap<u32, RecoveredTransaction> = BTreeMap::new();
        for name in self.store.map_names() {
            let Some(suffix) = name.strip_prefix(UNDO_MAP_PREFIX) else {
                continue;
            };
            let Ok(id) = suffix.parse::<u32>() else {
                warn!(name, "ignoring undo map with malformed name");
                continue;
            };
            let undo = self.store.open_map::<UndoLogRecord>(&name)?;
            let Some((last, _)) = undo.last_entry() else {
                continue;
            };
            let log_id = last
                .as_integer()
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| CoreError::corruption(format!("undo map {name} has key {last}")))?;
            recovered.entry(id).or_default().log_id = log_id;
        }
        for key in self.meta.keys() {
            let id = key
                .as_integer()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| CoreError::corruption(format!("transaction meta key {key}")))?;
            if let Some(meta) = self.meta.get(&key) {
                recovered.entry(id).or_default().meta = Some(meta.as_ref().clone());
            }
        }

        for (id, tx) in recovered {
            if id == 0 || id > MAX_OPEN_TRANSACTIONS {
                return Err(CoreError::corruption(format!(
                    "recovered transaction id {id} out of range"
                )));
            }
            let (status, name) = match tx.meta {
                Some(TxMeta {
                    status: TransactionStatus::Prepared,
                    name,
                }) => (TransactionStatus::Prepared, name),
                Some(TxMeta {
                    status: TransactionStatus::Committing,
                    name,
                }) => (TransactionStatus::Committing, name),
                Some(TxMeta { name, .. }) => (TransactionStatus::Open, name),
                None => (TransactionStatus::Open, None),
            };
            let slot = self.slot_for(TransactionId::new(id))?;
            slot.reset(status, name, tx.log_id);
            open.live.insert(id);
            open.last_id = open.last_id.max(id);
            debug!(id, ?status, log_id = tx.log_id, "transaction recovered");
        }

        self.initialized.store(true, Ordering::Release);
        info!(open = open.live.len(), "transaction store initialized");
        Ok(())
    }

    /// Starts a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotInitialized`] before [`TransactionStore::init`],
    /// [`CoreError::TooManyOpenTransactions`] if every id is taken, or
    /// [`CoreError::StoreClosed`].
    pub fn begin(self: &Arc<Self>) -> CoreResult<Transaction> {
        self.store.ensure_open()?;
        if !self.initialized.load(Ordering::Acquire) {
            return Err(CoreError::NotInitialized);
        }

        let mut open = self.open.lock();
        let max = self.max_transaction_id.load(Ordering::Acquire);
        let id = open
            .next_free(max)
            .ok_or(CoreError::TooManyOpenTransactions { max })?;
        let slot = self.slot_for(TransactionId::new(id))?;
        if !slot.undo.is_empty() {
            warn!(id, "discarding stale undo log of a finished transaction");
            slot.undo.clear()?;
        }
        slot.reset(TransactionStatus::Open, None, 0);
        open.live.insert(id);
        open.last_id = id;
        drop(open);

        debug!(id, "transaction started");
        Ok(Transaction::new(Arc::clone(self), slot))
    }

    /// Returns every transaction that has not finished, by ascending id,
    /// including those recovered by [`TransactionStore::init`].
    #[must_use]
    pub fn get_open_transactions(self: &Arc<Self>) -> Vec<Transaction> {
        let ids: Vec<u32> = self.open.lock().live.iter().copied().collect();
        let slots = self.slots.read();
        ids.into_iter()
            .filter_map(|id| slots.get(id as usize).cloned().flatten())
            .filter(|slot| slot.status().is_active())
            .map(|slot| Transaction::new(Arc::clone(self), slot))
            .collect()
    }

    /// Returns the largest transaction id [`TransactionStore::begin`] hands out.
    #[must_use]
    pub fn max_transaction_id(&self) -> u32 {
        self.max_transaction_id.load(Ordering::Acquire)
    }

    /// Limits transaction ids to `1..=max`.
    ///
    /// # Errors
    ///
    /// Fails unless `1 <= max <= MAX_OPEN_TRANSACTIONS`.
    pub fn set_max_transaction_id(&self, max: u32) -> CoreResult<()> {
        check_max_transaction_id(max)?;
        self.max_transaction_id.store(max, Ordering::Release);
        Ok(())
    }

    /// Returns true if a data map called `name` exists.
    #[must_use]
    pub fn has_map(&self, name: &str) -> bool {
        !name.starts_with(RESERVED_PREFIX) && self.store.has_map(name)
    }

    /// Closes the underlying store, persisting it.
    ///
    /// # Errors
    ///
    /// Fails if the final snapshot cannot be written.
    pub fn close(&self) -> CoreResult<()> {
        self.store.close()
    }

    fn slot_for(&self, id: TransactionId) -> CoreResult<Arc<TxnSlot>> {
        let index = id.as_u32() as usize;
        if let Some(Some(slot)) = self.slots.read().get(index) {
            return Ok(Arc::clone(slot));
        }
        let undo = self.store.open_map::<UndoLogRecord>(&undo_map_name(id))?;
        let mut slots = self.slots.write();
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        Ok(Arc::clone(
            slots[index].get_or_insert_with(|| Arc::new(TxnSlot::new(id, undo))),
        ))
    }

    fn status_of(&self, id: TransactionId) -> TransactionStatus {
        self.slots
            .read()
            .get(id.as_u32() as usize)
            .and_then(Option::as_ref)
            .map_or(TransactionStatus::Closed, |slot| slot.status())
    }

    pub(crate) fn open_data_map(&self, name: &str) -> CoreResult<Arc<MvMap<VersionedValue>>> {
        if name.starts_with(RESERVED_PREFIX) {
            return Err(CoreError::invalid_operation(format!(
                "map name {name} is reserved"
            )));
        }
        self.store.open_map::<VersionedValue>(name)
    }

    fn data_map(
        &self,
        id: MapId,
        tx: TransactionId,
    ) -> CoreResult<Option<Arc<MvMap<VersionedValue>>>> {
        let map = self.store.map_by_id::<VersionedValue>(id)?;
        if map.is_none() {
            warn!(%tx, map = %id, "skipping undo record of a removed map");
        }
        Ok(map)
    }

    /// The value of `cell` as seen by transaction `reader`.
    pub(crate) fn visible<'a>(
        &self,
        reader: TransactionId,
        cell: &'a VersionedValue,
    ) -> Option<&'a Value> {
        match cell {
            VersionedValue::Committed(value) => Some(value),
            VersionedValue::Uncommitted {
                operation_id,
                value,
                committed,
            } => {
                let writer = operation_id.transaction_id();
                if writer == reader || self.status_of(writer).exposes_pending() {
                    value.as_ref()
                } else {
                    committed.as_ref()
                }
            }
        }
    }

    /// Writes `key` on behalf of `tx`.
    ///
    /// `decide` sees the value visible to `tx` and may run more than once
    /// if the key changes underneath.
    pub(crate) fn write(
        &self,
        tx: &Transaction,
        map: &MvMap<VersionedValue>,
        key: &Value,
        mode: LockMode,
        mut decide: impl FnMut(Option<&Value>) -> Decision,
    ) -> CoreResult<WriteOutcome> {
        tx.check_writable()?;
        let me = tx.id();
        let started = Instant::now();
        loop {
            let current = map.get(key);
            // visible value, fallback for the new cell, cell for the undo log
            let (visible, fallback, old) = match current.as_deref() {
                None => (None, None, None),
                Some(VersionedValue::Committed(value)) => (
                    Some(value.clone()),
                    Some(value.clone()),
                    Some(VersionedValue::Committed(value.clone())),
                ),
                Some(VersionedValue::Uncommitted {
                    operation_id,
                    value,
                    committed,
                }) => {
                    let writer = operation_id.transaction_id();
                    if writer == me {
                        (
                            value.clone(),
                            committed.clone(),
                            current.as_deref().cloned(),
                        )
                    } else {
                        let status = self.status_of(writer);
                        if status.holds_locks() {
                            if mode == LockMode::NoWait {
                                return Ok(WriteOutcome::Locked);
                            }
                            self.wait_for_release(tx, writer, map, key, started)?;
                            continue;
                        }
                        let effective = if status.exposes_pending() {
                            value.clone()
                        } else {
                            committed.clone()
                        };
                        let old = effective.clone().map(VersionedValue::Committed);
                        (effective.clone(), effective, old)
                    }
                }
            };

            let value = match decide(visible.as_ref()) {
                Decision::Keep => return Ok(WriteOutcome::Unchanged { current: visible }),
                Decision::Set(None) if current.is_none() => {
                    return Ok(WriteOutcome::Unchanged { current: None })
                }
                Decision::Set(value) => value,
                Decision::Lock => visible.clone(),
            };

            let _guard = self.store.checkpoint_guard();
            let log_id = self.append_undo(
                tx.slot(),
                UndoLogRecord {
                    map_id: map.id(),
                    key: key.clone(),
                    old,
                },
            )?;
            let cell = Arc::new(VersionedValue::Uncommitted {
                operation_id: OperationId::new(me, log_id),
                value,
                committed: fallback,
            });
            match map.compare_and_set(key, current.as_ref(), Some(cell)) {
                Ok(true) => return Ok(WriteOutcome::Applied { previous: visible }),
                Ok(false) => {
                    trace!(%me, %key, "cell changed concurrently, retrying");
                    self.pop_undo(tx.slot(), log_id)?;
                }
                Err(e) => {
                    self.pop_undo(tx.slot(), log_id)?;
                    return Err(e);
                }
            }
        }
    }

    fn wait_for_release(
        &self,
        tx: &Transaction,
        holder: TransactionId,
        map: &MvMap<VersionedValue>,
        key: &Value,
        started: Instant,
    ) -> CoreResult<()> {
        let mut slice = self.config.wait_slice;
        if let Some(timeout) = self.config.lock_timeout {
            let waited = started.elapsed();
            if waited >= timeout {
                debug!(tx = %tx.id(), %holder, map = map.name(), %key, "lock wait timed out");
                return Err(CoreError::Locked {
                    map: map.name().to_string(),
                    key: key.to_string(),
                });
            }
            slice = slice.min(timeout - waited);
        }
        self.waits.wait(tx.id(), holder, slice, || {
            self.status_of(holder).holds_locks()
        })?;
        tx.check_writable()
    }

    fn append_undo(&self, slot: &TxnSlot, record: UndoLogRecord) -> CoreResult<u64> {
        let log_id = slot.log_id() + 1;
        if log_id > OperationId::MAX_LOG_ID {
            return Err(CoreError::invalid_operation(format!(
                "undo log of transaction {} is full",
                slot.id
            )));
        }
        slot.undo.put(log_key(log_id), record)?;
        slot.set_log_id(log_id);
        if log_id == 1 && self.meta.get(&meta_key(slot.id)).is_none() {
            self.meta.put(meta_key(slot.id), slot.meta())?;
        }
        Ok(log_id)
    }

    fn pop_undo(&self, slot: &TxnSlot, log_id: u64) -> CoreResult<()> {
        slot.undo.remove(&log_key(log_id))?;
        slot.set_log_id(log_id - 1);
        Ok(())
    }

    pub(crate) fn set_name(&self, tx: &Transaction, name: String) -> CoreResult<()> {
        tx.check_current()?;
        let slot = tx.slot();
        slot.set_name(Some(name));
        if slot.status().is_active() {
            self.store.ensure_open()?;
            let _guard = self.store.checkpoint_guard();
            self.meta.put(meta_key(slot.id), slot.meta())?;
        }
        Ok(())
    }

    pub(crate) fn prepare(&self, tx: &Transaction) -> CoreResult<()> {
        tx.check_writable()?;
        let slot = tx.slot();
        {
            let _guard = self.store.checkpoint_guard();
            slot.set_status(TransactionStatus::Prepared);
            self.meta.put(meta_key(slot.id), slot.meta())?;
        }
        self.store.commit()?;
        debug!(id = %slot.id, "transaction prepared");
        Ok(())
    }

    fn check_finishable(
        &self,
        tx: &Transaction,
        action: &str,
        allowed: &[TransactionStatus],
    ) -> CoreResult<()> {
        self.store.ensure_open()?;
        tx.check_current()?;
        let status = tx.slot().status();
        if allowed.contains(&status) {
            return Ok(());
        }
        Err(CoreError::invalid_operation(format!(
            "cannot {action} transaction {} in state {status:?}",
            tx.id()
        )))
    }

    /// Commits `tx`. A transaction left `Committing` by a failed commit may
    /// commit again.
    pub(crate) fn commit(&self, tx: &Transaction) -> CoreResult<()> {
        self.check_finishable(
            tx,
            "commit",
            &[
                TransactionStatus::Open,
                TransactionStatus::Prepared,
                TransactionStatus::Committing,
            ],
        )?;
        let slot = tx.slot();
        let guard = self.store.checkpoint_guard();
        slot.set_status(TransactionStatus::Committing);
        if let Err(e) = self.resolve_commit(slot) {
            // the undo log and the id stay so the cells keep their writer
            if let Err(meta) = self.meta.put(meta_key(slot.id), slot.meta()) {
                warn!(id = %slot.id, error = %meta, "failed to record committing state");
            }
            drop(guard);
            self.waits.notify();
            warn!(id = %slot.id, error = %e, "commit left records unresolved");
            return Err(e);
        }
        let cleared = self.clear_log(slot);
        slot.set_status(TransactionStatus::Committed);
        drop(guard);
        self.release(slot);
        debug!(id = %slot.id, "transaction committed");

        cleared?;
        if self.config.flush_on_commit {
            self.store.commit()?;
        }
        Ok(())
    }

    /// Publishes every record of the undo log, returning the first failure.
    fn resolve_commit(&self, slot: &TxnSlot) -> CoreResult<()> {
        let mut first_error = None;
        for log_id in 1..=slot.log_id() {
            let Some(record) = slot.undo.get(&log_key(log_id)) else {
                continue;
            };
            if let Err(e) = self.publish(slot, &record) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn publish(&self, slot: &TxnSlot, record: &UndoLogRecord) -> CoreResult<()> {
        let Some(map) = self.data_map(record.map_id, slot.id)? else {
            return Ok(());
        };
        let Some(cell) = map.get(&record.key) else {
            return Ok(());
        };
        let VersionedValue::Uncommitted {
            operation_id,
            value,
            ..
        } = cell.as_ref()
        else {
            return Ok(());
        };
        if operation_id.transaction_id() != slot.id {
            return Ok(());
        }
        let committed = value
            .clone()
            .map(|v| Arc::new(VersionedValue::Committed(v)));
        match map.compare_and_set(&record.key, Some(&cell), committed) {
            Ok(_) => Ok(()),
            Err(CoreError::MapClosed { name }) => {
                warn!(id = %slot.id, map = name, "map removed during commit");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn rollback(&self, tx: &Transaction) -> CoreResult<()> {
        self.check_finishable(
            tx,
            "roll back",
            &[TransactionStatus::Open, TransactionStatus::Prepared],
        )?;
        let slot = tx.slot();
        let guard = self.store.checkpoint_guard();
        slot.set_status(TransactionStatus::RollingBack);
        let undone = self.undo_to(slot, 0);
        let cleared = self.clear_log(slot);
        slot.set_status(TransactionStatus::RolledBack);
        drop(guard);
        self.release(slot);
        debug!(id = %slot.id, "transaction rolled back");

        undone?;
        cleared
    }

    pub(crate) fn rollback_to_savepoint(&self, tx: &Transaction, savepoint: u64) -> CoreResult<()> {
        tx.check_writable()?;
        let slot = tx.slot();
        if savepoint > slot.log_id() {
            return Err(CoreError::invalid_operation(format!(
                "savepoint {savepoint} is ahead of log id {}",
                slot.log_id()
            )));
        }
        let undone = {
            let _guard = self.store.checkpoint_guard();
            self.undo_to(slot, savepoint)
        };
        self.waits.notify();
        debug!(id = %slot.id, savepoint, "rolled back to savepoint");
        undone
    }

    /// Reverts the records after `savepoint`, newest first, and drops them.
    fn undo_to(&self, slot: &TxnSlot, savepoint: u64) -> CoreResult<()> {
        for log_id in (savepoint + 1..=slot.log_id()).rev() {
            let key = log_key(log_id);
            if let Some(record) = slot.undo.get(&key) {
                self.restore(slot, log_id, &record)?;
            }
            slot.undo.remove(&key)?;
            slot.set_log_id(log_id - 1);
        }
        Ok(())
    }

    fn restore(&self, slot: &TxnSlot, log_id: u64, record: &UndoLogRecord) -> CoreResult<()> {
        let Some(map) = self.data_map(record.map_id, slot.id)? else {
            return Ok(());
        };
        let Some(cell) = map.get(&record.key) else {
            return Ok(());
        };
        if cell.operation_id() != Some(OperationId::new(slot.id, log_id)) {
            return Ok(());
        }
        let old = record.old.clone().map(Arc::new);
        match map.compare_and_set(&record.key, Some(&cell), old) {
            Ok(_) => Ok(()),
            Err(CoreError::MapClosed { name }) => {
                warn!(id = %slot.id, map = name, "map removed during rollback");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn clear_log(&self, slot: &TxnSlot) -> CoreResult<()> {
        slot.set_log_id(0);
        slot.undo.clear()?;
        self.meta.remove(&meta_key(slot.id))?;
        Ok(())
    }

    fn release(&self, slot: &TxnSlot) {
        self.open.lock().live.remove(&slot.id.as_u32());
        self.waits.release(slot.id);
    }
}

fn check_max_transaction_id(max: u32) -> CoreResult<()> {
    if max == 0 || max > MAX_OPEN_TRANSACTIONS {
        return Err(CoreError::invalid_operation(format!(
            "max transaction id {max} not in 1..={MAX_OPEN_TRANSACTIONS}"
        )));
    }
    Ok(())
}

impl fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStore")
            .field("open", &self.open.lock().live.len())
            .field("max_transaction_id", &self.max_transaction_id())
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .finish()
    }
}
