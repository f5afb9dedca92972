//! The underlying versioned map store.
//!
//! Named, ordered maps with per-key compare-and-set, persisted as
//! checksummed snapshots over a storage backend. The transaction layer in
//! [`crate::tx`] is built on these primitives.

mod map;
mod snapshot;
mod store;

pub use map::{MapEntry, MapValue, MvMap};
pub use snapshot::{SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use store::MvStore;
