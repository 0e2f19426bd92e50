//! Value conversion traits

use crate::error::ConvertError;
use crate::value::Value;

/// Read a host type out of a value.
///
/// Implement this trait to accept your type as a native function argument.
pub trait FromValue: Sized {
    /// Convert, failing if the value has the wrong type
    fn from_value(value: &Value) -> Result<Self, ConvertError>;
}

/// Turn a host type into a value.
///
/// Implement this trait to return your type from a native function.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

// ============================================================================
// Primitive Type Implementations
// ============================================================================

fn mismatch(expected: &'static str, value: &Value) -> ConvertError {
    ConvertError {
        expected,
        got: value.type_name(),
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, ConvertError> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, ConvertError> {
        value.as_bool().ok_or_else(|| mismatch("boolean", value))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self, ConvertError> {
        value.as_i32().ok_or_else(|| mismatch("int32", value))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, ConvertError> {
        match value.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => Ok(f as i64),
            _ => Err(mismatch("integer", value)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, ConvertError> {
        value.as_f64().ok_or_else(|| mismatch("number", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, ConvertError> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch("string", value))
    }
}

/// `undefined` and `null` map to `None`
impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, ConvertError> {
        if value.is_nullish() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::undefined()
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::bool(self)
    }
}

impl IntoValue for i32 {
    fn into_value(self) -> Value {
        Value::int32(self)
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        match i32::try_from(self) {
            Ok(i) => Value::int32(i),
            Err(_) => Value::float64(self as f64),
        }
    }
}

impl IntoValue for u32 {
    fn into_value(self) -> Value {
        i64::from(self).into_value()
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::float64(self)
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::string(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::string(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_value_primitives() {
        assert_eq!(i32::from_value(&Value::from(3)).unwrap(), 3);
        assert_eq!(f64::from_value(&Value::from(3)).unwrap(), 3.0);
        assert_eq!(i64::from_value(&Value::from(1e12)).unwrap(), 1_000_000_000_000);
        assert_eq!(String::from_value(&Value::from("s")).unwrap(), "s");
        assert!(bool::from_value(&Value::from(1)).is_err());
    }

    #[test]
    fn test_mismatch_reports_types() {
        let err = i32::from_value(&Value::from("x")).unwrap_err();
        assert_eq!(err.expected, "int32");
        assert_eq!(err.got, "string");
    }

    #[test]
    fn test_option_conversions() {
        assert_eq!(Option::<i32>::from_value(&Value::null()).unwrap(), None);
        assert_eq!(Option::<i32>::from_value(&Value::from(4)).unwrap(), Some(4));
        assert!(None::<i32>.into_value().is_null());
    }

    #[test]
    fn test_into_value_widens_large_integers() {
        assert_eq!(7i64.into_value().as_i32(), Some(7));
        let big = (i64::from(i32::MAX) + 1).into_value();
        assert_eq!(big.as_f64(), Some(2_147_483_648.0));
        assert_eq!(u32::MAX.into_value().as_f64(), Some(u32::MAX as f64));
    }
}
