//! MVCC transactions over the map store.
//!
//! - [`TransactionStore`] hands out transactions and runs the commit,
//!   rollback and lock-wait protocols
//! - [`Transaction`] is a handle to one transaction
//! - [`TransactionMap`] is a map as seen by one transaction
//! - [`VersionedValue`] is the cell stored under every key of a
//!   transactional map
//! - [`UndoLogRecord`] is one entry of a transaction's undo log
//!
//! ## Visibility
//!
//! Transactions read committed data plus their own pending writes. A
//! commit first flips the transaction to `Committing`, from which instant
//! every reader treats its pending values as committed, then rewrites its
//! cells one by one.
//!
//! ## Locking
//!
//! The first write of a transaction to a key locks the key until the
//! transaction ends. Blocking writers park on a condition variable; before
//! every park the wait-for graph is checked and a wait that would close a
//! cycle fails with `Deadlock`.

mod deadlock;
mod map;
mod store;
mod transaction;
mod undo;
mod versioned;

pub use map::{Entries, Keys, TransactionMap};
pub use store::TransactionStore;
pub use transaction::{Transaction, TransactionStatus};
pub use undo::{Change, Changes, UndoLogRecord, RESERVED_PREFIX};
pub use versioned::VersionedValue;
