//! Core identifier types for MVTX.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest transaction id, and so the largest number of transactions that
/// can be open at the same time.
pub const MAX_OPEN_TRANSACTIONS: u32 = 65_535;

/// Identifier of a transaction.
///
/// Ids range over `1..=max_transaction_id` and are reused once the
/// transaction that held one has committed or rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u32);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

/// Identity of one write: the writing transaction plus the log id of the
/// undo record the write appended.
///
/// Packed into a `u64`, transaction id in the upper 24 bits and log id in
/// the lower 40. Log ids start at 1, so a real operation id is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(u64);

impl OperationId {
    /// Number of bits used for the log id.
    pub const LOG_ID_BITS: u32 = 40;

    /// Largest log id a transaction can reach.
    pub const MAX_LOG_ID: u64 = (1 << Self::LOG_ID_BITS) - 1;

    /// Packs a transaction id and a log id.
    #[must_use]
    pub const fn new(transaction_id: TransactionId, log_id: u64) -> Self {
        Self(((transaction_id.0 as u64) << Self::LOG_ID_BITS) | (log_id & Self::MAX_LOG_ID))
    }

    /// Returns the id of the writing transaction.
    #[must_use]
    pub const fn transaction_id(self) -> TransactionId {
        TransactionId((self.0 >> Self::LOG_ID_BITS) as u32)
    }

    /// Returns the log id within the writing transaction.
    #[must_use]
    pub const fn log_id(self) -> u64 {
        self.0 & Self::MAX_LOG_ID
    }

    /// Returns the packed value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op:{}/{}", self.transaction_id().0, self.log_id())
    }
}

/// Stable numeric identifier of a map in the store.
///
/// Ids are assigned when a map is created and never reused, so a map that
/// was removed and created again under the same name gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapId(pub u32);

impl MapId {
    /// Creates a new map ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map:{}", self.0)
    }
}
