//! Undo log records and the change iterator built on them.

use crate::mvstore::{MvMap, MvStore};
use crate::tx::versioned::VersionedValue;
use crate::types::{MapId, TransactionId};
use mvtx_codec::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Prefix of every map name owned by the transaction layer.
pub const RESERVED_PREFIX: &str = "_tx.";

/// Map holding the persisted status and name of open transactions.
pub(crate) const META_MAP_NAME: &str = "_tx.meta";

/// Prefix of the per-transaction undo maps, followed by the id.
pub(crate) const UNDO_MAP_PREFIX: &str = "_tx.undo.";

pub(crate) fn undo_map_name(id: TransactionId) -> String {
    format!("{UNDO_MAP_PREFIX}{}", id.as_u32())
}

/// Key of a log id in an undo map.
pub(crate) fn log_key(log_id: u64) -> Value {
    Value::Integer(log_id as i64)
}

/// One mutation made by a transaction, enough to revert it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoLogRecord {
    /// The map that was written.
    pub map_id: MapId,
    /// The key that was written.
    pub key: Value,
    /// The cell before the write; `None` if the key was absent.
    pub old: Option<VersionedValue>,
}

impl UndoLogRecord {
    /// The value the writing transaction saw before this write.
    #[must_use]
    pub fn old_value(&self) -> Option<&Value> {
        self.old.as_ref().and_then(VersionedValue::current_value)
    }
}

/// A change made by a transaction, as reported by
/// [`Transaction::get_changes`](crate::Transaction::get_changes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Name of the changed map.
    pub map_name: String,
    /// The changed key.
    pub key: Value,
    /// The value before the change; `None` if the key did not exist.
    pub value: Option<Value>,
}

/// Iterator over a transaction's changes, most recent first.
///
/// Reads the undo log lazily; records of maps that were removed meanwhile
/// are skipped.
pub struct Changes {
    store: Arc<MvStore>,
    undo: Arc<MvMap<UndoLogRecord>>,
    next: u64,
    since: u64,
}

impl Changes {
    pub(crate) fn new(
        store: Arc<MvStore>,
        undo: Arc<MvMap<UndoLogRecord>>,
        log_id: u64,
        since: u64,
    ) -> Self {
        Self {
            store,
            undo,
            next: log_id,
            since,
        }
    }
}

impl Iterator for Changes {
    type Item = Change;

    fn next(&mut self) -> Option<Change> {
        while self.next > self.since {
            let log_id = self.next;
            self.next -= 1;
            let Some(record) = self.undo.get(&log_key(log_id)) else {
                continue;
            };
            let Some(map_name) = self.store.map_name(record.map_id) else {
                continue;
            };
            return Some(Change {
                map_name,
                key: record.key.clone(),
                value: record.old_value().cloned(),
            });
        }
        None
    }
}

impl fmt::Debug for Changes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changes")
            .field("next", &self.next)
            .field("since", &self.since)
            .finish()
    }
}
