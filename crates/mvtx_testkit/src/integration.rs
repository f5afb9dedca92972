//! Model-checked integration helpers.
//!
//! Runs generated operation sequences against a real transaction store
//! and a plain `BTreeMap` model, and compares what each transaction sees.

use crate::fixtures::TestStore;
use crate::generators::{Outcome, TxOperation};
use mvtx_core::{CoreResult, Transaction, TransactionMap};
use std::collections::BTreeMap;

/// The map every harness transaction writes to.
pub const MODEL_MAP: &str = "model";

/// A test harness checking a transaction store against a model.
pub struct ModelHarness {
    /// The store under test.
    pub store: TestStore,
    committed: BTreeMap<i64, i64>,
}

impl Default for ModelHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelHarness {
    /// Creates a harness over an in-memory store.
    pub fn new() -> Self {
        Self {
            store: TestStore::memory(),
            committed: BTreeMap::new(),
        }
    }

    /// Returns the committed state according to the model.
    pub fn committed(&self) -> &BTreeMap<i64, i64> {
        &self.committed
    }

    /// Runs `ops` in a new transaction and ends it with `outcome`.
    ///
    /// Every read made by the transaction, and every view of a concurrent
    /// reader taken while it is open, is checked against the model.
    pub fn run(&mut self, ops: &[TxOperation], outcome: Outcome) {
        let tx = self.store.begin().expect("Failed to begin transaction");
        let map = tx
            .open_map::<i64, i64>(MODEL_MAP)
            .expect("Failed to open map");
        let own = apply(&tx, &map, ops, &self.committed).expect("Operation failed");
        assert_eq!(read_all(&map), own, "transaction view differs from model");

        // a second transaction only sees committed state
        let reader = self.store.begin().expect("Failed to begin reader");
        let view = reader
            .open_map::<i64, i64>(MODEL_MAP)
            .expect("Failed to open map");
        assert_eq!(read_all(&view), self.committed, "uncommitted data leaked");

        match outcome {
            Outcome::Commit => {
                tx.commit().expect("Failed to commit");
                self.committed = own;
            }
            Outcome::PrepareCommit => {
                tx.prepare().expect("Failed to prepare");
                assert_eq!(read_all(&view), self.committed, "prepared data leaked");
                tx.commit().expect("Failed to commit");
                self.committed = own;
            }
            Outcome::Rollback => tx.rollback().expect("Failed to roll back"),
        }
        assert_eq!(read_all(&view), self.committed, "reader missed the outcome");
        reader.commit().expect("Failed to end reader");
    }

    /// Checks the store against the model with a fresh transaction.
    pub fn verify(&self) {
        let tx = self.store.begin().expect("Failed to begin transaction");
        let map = tx
            .open_map::<i64, i64>(MODEL_MAP)
            .expect("Failed to open map");
        assert_eq!(read_all(&map), self.committed);
        assert_eq!(map.size().expect("Failed to count"), self.committed.len());
        tx.commit().expect("Failed to commit");
    }

    /// Checkpoints the store and recovers it, then verifies the model.
    pub fn restart_and_verify(&mut self) {
        self.store.checkpoint();
        self.store.reopen();
        assert!(
            self.store.get_open_transactions().is_empty(),
            "finished transactions were recovered"
        );
        self.verify();
    }
}

/// Applies `ops` through `map`, returning the state the transaction should
/// see afterwards.
///
/// Savepoints nest: rolling back returns to the most recent one and pops
/// it. With no savepoint taken, rolling back returns to the start.
///
/// # Errors
///
/// Fails if the store rejects an operation.
pub fn apply(
    tx: &Transaction,
    map: &TransactionMap<i64, i64>,
    ops: &[TxOperation],
    start: &BTreeMap<i64, i64>,
) -> CoreResult<BTreeMap<i64, i64>> {
    let mut model = start.clone();
    let mut savepoints: Vec<(u64, BTreeMap<i64, i64>)> = Vec::new();
    for op in ops {
        match *op {
            TxOperation::Put { key, value } => {
                let previous = map.put(key, value)?;
                assert_eq!(previous, model.insert(key, value), "put {key}");
            }
            TxOperation::Remove { key } => {
                let previous = map.remove(&key)?;
                assert_eq!(previous, model.remove(&key), "remove {key}");
            }
            TxOperation::Get { key } => {
                assert_eq!(map.get(&key)?, model.get(&key).copied(), "get {key}");
            }
            TxOperation::Savepoint => savepoints.push((tx.set_savepoint(), model.clone())),
            TxOperation::RollbackToSavepoint => {
                let (savepoint, state) = savepoints.pop().unwrap_or((0, start.clone()));
                tx.rollback_to_savepoint(savepoint)?;
                model = state;
            }
        }
    }
    Ok(model)
}

/// Reads every visible entry of `map`.
pub fn read_all(map: &TransactionMap<i64, i64>) -> BTreeMap<i64, i64> {
    map.iter()
        .collect::<CoreResult<BTreeMap<_, _>>>()
        .expect("Failed to iterate")
}
