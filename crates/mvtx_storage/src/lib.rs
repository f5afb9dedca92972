//! # MVTX Storage
//!
//! Byte-level storage backends for the MVTX map store.
//!
//! A backend is an **append-only byte log** with random reads. It has no
//! knowledge of maps, snapshots or transactions; the map store in
//! `mvtx_core` frames and checksums everything it writes.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - Ephemeral storage, shareable between store
//!   instances to simulate a process restart in tests
//! - [`FileBackend`] - Persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use mvtx_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"snapshot").unwrap();
//! assert_eq!(backend.read_at(offset, 8).unwrap(), b"snapshot");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
