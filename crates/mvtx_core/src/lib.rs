//! # MVTX Core
//!
//! Multi-version concurrency control over a versioned key-value store.
//!
//! This crate provides:
//! - [`MvStore`]: named, ordered maps with per-key compare-and-set,
//!   persisted as checksummed snapshots over a storage backend
//! - [`TransactionStore`]: transactions with read-committed visibility,
//!   savepoints, two-phase commit, row locks and deadlock detection
//! - [`TransactionMap`]: a typed, transaction-scoped map view
//!
//! ## Example
//!
//! ```
//! use mvtx_core::{MvStore, TransactionStore};
//! use std::sync::Arc;
//!
//! let ts = TransactionStore::new(Arc::new(MvStore::in_memory())).unwrap();
//! ts.init().unwrap();
//!
//! let tx = ts.begin().unwrap();
//! let accounts = tx.open_map::<String, i64>("accounts").unwrap();
//! accounts.put("alice".into(), 100).unwrap();
//! let savepoint = tx.set_savepoint();
//! accounts.put("alice".into(), 0).unwrap();
//! tx.rollback_to_savepoint(savepoint).unwrap();
//! tx.commit().unwrap();
//!
//! let tx = ts.begin().unwrap();
//! let accounts = tx.open_map::<String, i64>("accounts").unwrap();
//! assert_eq!(accounts.get(&"alice".into()).unwrap(), Some(100));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
pub mod mvstore;
pub mod tx;
mod types;

pub use config::{StoreConfig, TransactionConfig};
pub use error::{CoreError, CoreResult};
pub use mvstore::{MvMap, MvStore};
pub use tx::{
    Change, Changes, Transaction, TransactionMap, TransactionStatus, TransactionStore,
    UndoLogRecord, VersionedValue,
};
pub use types::{MapId, OperationId, TransactionId, MAX_OPEN_TRANSACTIONS};

pub use mvtx_codec::{Value, ValueType};
pub use mvtx_storage::{FileBackend, InMemoryBackend, StorageBackend};
