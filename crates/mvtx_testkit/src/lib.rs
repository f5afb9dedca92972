//! # MVTX Testkit
//!
//! Test utilities for the MVTX transaction store.
//!
//! This crate provides:
//! - Store fixtures that can be reopened to simulate a restart
//! - Property-based test generators using proptest
//! - A model-checking harness comparing the store with a `BTreeMap`
//! - Crash recovery harnesses over a failure-injecting backend
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust
//! use mvtx_testkit::prelude::*;
//!
//! let mut store = TestStore::memory();
//! let tx = store.begin().unwrap();
//! tx.open_map::<i64, i64>("test").unwrap().put(1, 1).unwrap();
//! tx.commit().unwrap();
//! store.checkpoint();
//! store.reopen();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
