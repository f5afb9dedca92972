//! Conversions between Rust types and [`Value`].

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// A Rust type that can be stored as a map key or value.
///
/// This plays the role of a map's key type / value type: a typed map view
/// converts with `to_value` on the way in and `from_value` on the way out.
pub trait ValueType: Sized {
    /// Converts this value to its stored form.
    fn to_value(&self) -> Value;

    /// Converts a stored value back.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] if the stored value has another
    /// kind, or [`CodecError::IntegerOverflow`] if it does not fit.
    fn from_value(value: Value) -> CodecResult<Self>;
}

impl ValueType for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        Ok(value)
    }
}

impl ValueType for i64 {
    fn to_value(&self) -> Value {
        Value::Integer(*self)
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        match value {
            Value::Integer(n) => Ok(n),
            other => Err(CodecError::type_mismatch("i64", other.kind())),
        }
    }
}

macro_rules! narrow_integer {
    ($($ty:ty),*) => {
        $(
            impl ValueType for $ty {
                fn to_value(&self) -> Value {
                    Value::Integer(i64::from(*self))
                }

                fn from_value(value: Value) -> CodecResult<Self> {
                    match value {
                        Value::Integer(n) => <$ty>::try_from(n).map_err(|_| {
                            CodecError::IntegerOverflow {
                                value: n,
                                target: stringify!($ty),
                            }
                        }),
                        other => Err(CodecError::type_mismatch(stringify!($ty), other.kind())),
                    }
                }
            }
        )*
    };
}

narrow_integer!(i32, u32);

/// Stored as eight big-endian bytes, so the full range survives and keys
/// keep their numeric order.
impl ValueType for u64 {
    fn to_value(&self) -> Value {
        Value::Bytes(self.to_be_bytes().to_vec())
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        match value {
            Value::Bytes(b) => <[u8; 8]>::try_from(b.as_slice())
                .map(u64::from_be_bytes)
                .map_err(|_| {
                    CodecError::decoding_failed(format!("u64 needs 8 bytes, found {}", b.len()))
                }),
            other => Err(CodecError::type_mismatch("u64", other.kind())),
        }
    }
}

impl ValueType for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(CodecError::type_mismatch("bool", other.kind())),
        }
    }
}

impl ValueType for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(CodecError::type_mismatch("String", other.kind())),
        }
    }
}

impl ValueType for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(CodecError::type_mismatch("Vec<u8>", other.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_conversions() {
        assert_eq!(42i64.to_value(), Value::Integer(42));
        assert_eq!(i64::from_value(Value::Integer(-1)).unwrap(), -1);
        assert_eq!(i32::from_value(Value::Integer(7)).unwrap(), 7);
        assert!(matches!(
            i32::from_value(Value::Integer(i64::MAX)),
            Err(CodecError::IntegerOverflow { target: "i32", .. })
        ));
    }

    #[test]
    fn u64_keeps_full_range_and_order() {
        for n in [0, 1, i64::MAX as u64, i64::MAX as u64 + 1, u64::MAX] {
            assert_eq!(u64::from_value(n.to_value()).unwrap(), n);
        }
        assert!(1u64.to_value() < u64::MAX.to_value());
        assert!((i64::MAX as u64).to_value() < (i64::MAX as u64 + 1).to_value());
        assert!(matches!(
            u64::from_value(Value::Bytes(vec![1, 2, 3])),
            Err(CodecError::DecodingFailed { .. })
        ));
        assert!(matches!(
            u64::from_value(Value::Integer(5)),
            Err(CodecError::TypeMismatch { expected: "u64", .. })
        ));
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let err = String::from_value(Value::Integer(1)).unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                expected: "String",
                found: "integer"
            }
        );
        assert!(bool::from_value(Value::Null).is_err());
        assert!(Vec::<u8>::from_value(Value::from("x")).is_err());
    }

    #[test]
    fn text_and_bytes() {
        let s = "hello".to_string();
        assert_eq!(String::from_value(s.to_value()).unwrap(), s);
        let b = vec![1u8, 2, 3];
        assert_eq!(Vec::<u8>::from_value(b.to_value()).unwrap(), b);
        assert!(bool::from_value(true.to_value()).unwrap());
    }
}
