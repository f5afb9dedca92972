//! The value cell stored in transactional maps.

use crate::types::OperationId;
use mvtx_codec::Value;
use serde::{Deserialize, Serialize};

/// The payload of a key in a transactional map.
///
/// A key holds at most one uncommitted version at a time: the write of the
/// single transaction that currently owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionedValue {
    /// A committed value with no pending writer.
    Committed(Value),
    /// A write that has not been committed yet.
    Uncommitted {
        /// The writing transaction and its undo record.
        operation_id: OperationId,
        /// The tentative value; `None` is a pending delete.
        value: Option<Value>,
        /// The value before the writer first touched this key; `None` if
        /// the key did not exist.
        committed: Option<Value>,
    },
}

impl VersionedValue {
    /// Returns the pending writer, if any.
    #[must_use]
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            Self::Committed(_) => None,
            Self::Uncommitted { operation_id, .. } => Some(*operation_id),
        }
    }

    /// Returns true if there is no pending writer.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// The newest value, as seen by the writer itself.
    #[must_use]
    pub fn current_value(&self) -> Option<&Value> {
        match self {
            Self::Committed(value) => Some(value),
            Self::Uncommitted { value, .. } => value.as_ref(),
        }
    }

    /// The last committed value, as seen by everyone but the writer.
    #[must_use]
    pub fn committed_value(&self) -> Option<&Value> {
        match self {
            Self::Committed(value) => Some(value),
            Self::Uncommitted { committed, .. } => committed.as_ref(),
        }
    }
}
