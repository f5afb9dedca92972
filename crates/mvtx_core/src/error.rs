//! Error types for MVTX core.

use crate::types::TransactionId;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in MVTX core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] mvtx_storage::StorageError),

    /// Value conversion or CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] mvtx_codec::CodecError),

    /// Persisted data is corrupted or has an unknown format.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// A key is held by another transaction and the lock wait timed out.
    #[error("entry locked by another transaction: map {map}, key {key}")]
    Locked {
        /// Name of the map.
        map: String,
        /// Display form of the key.
        key: String,
    },

    /// Waiting for a lock would close a cycle in the wait-for graph.
    ///
    /// The transaction should be rolled back.
    #[error("deadlock: {transaction_id} waits for {blocker}, which waits for it")]
    Deadlock {
        /// The transaction whose wait was refused.
        transaction_id: TransactionId,
        /// The transaction holding the contested key.
        blocker: TransactionId,
    },

    /// Every transaction id is in use.
    #[error("too many open transactions (limit {max})")]
    TooManyOpenTransactions {
        /// The configured maximum transaction id.
        max: u32,
    },

    /// The transaction handle refers to a transaction that has ended and
    /// whose id was handed to a later transaction.
    #[error("transaction {id} is closed")]
    TransactionClosed {
        /// Id the handle was created with.
        id: TransactionId,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The store is closed.
    #[error("store is closed")]
    StoreClosed,

    /// The map was removed from the store.
    #[error("map {name} is closed")]
    MapClosed {
        /// Name of the map.
        name: String,
    },

    /// The map exists with a different cell type.
    #[error("map {name} was opened with another value type")]
    MapTypeMismatch {
        /// Name of the map.
        name: String,
    },

    /// `TransactionStore::init` has not been called.
    #[error("transaction store is not initialized")]
    NotInitialized,
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a map closed error.
    pub fn map_closed(name: impl Into<String>) -> Self {
        Self::MapClosed { name: name.into() }
    }

    /// Returns true if retrying the operation later may succeed.
    ///
    /// Only lock timeouts qualify; a deadlock requires rolling back first.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}
