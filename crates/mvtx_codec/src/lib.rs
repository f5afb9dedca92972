//! # MVTX Codec
//!
//! Values and serialization for the MVTX map store.
//!
//! - [`Value`]: the dynamic, totally ordered type every map stores
//! - [`ValueType`]: conversions used by typed map views
//! - [`to_cbor`] / [`from_cbor`]: serde-based CBOR used for snapshots
//!
//! ## Usage
//!
//! ```
//! use mvtx_codec::{from_cbor, to_cbor, Value, ValueType};
//!
//! let value = 42i64.to_value();
//! let bytes = to_cbor(&value).unwrap();
//! let decoded: Value = from_cbor(&bytes).unwrap();
//! assert_eq!(i64::from_value(decoded).unwrap(), 42);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod types;
mod value;

pub use cbor::{from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use types::ValueType;
pub use value::Value;
