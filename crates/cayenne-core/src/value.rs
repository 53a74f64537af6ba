//! Dynamic column values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dynamically-typed column value.
///
/// Rows, snapshots, object properties and primary keys all carry values of
/// this type. Structural equality (`PartialEq`) is type-sensitive; use
/// [`Value::key_eq`] or [`Value::canonical`] when numeric values of different
/// widths must compare equal, as primary key lookups do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Time (microseconds since midnight)
    Time(i64),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

/// Type-insensitive normal form of a [`Value`].
///
/// All numeric variants collapse into [`CanonicalValue::Number`] holding a
/// normalized decimal string, so `Int(1)`, `BigInt(1)`, `Double(1.0)` and
/// `Decimal("1.00")` share one canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Number(String),
    /// Numeric value with no decimal form, such as a NaN or a malformed
    /// decimal literal.
    RawNumber(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(i32),
    Time(i64),
    Timestamp(i64),
    Uuid([u8; 16]),
    Json(String),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value is one of the numeric variants.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::TinyInt(_)
                | Value::SmallInt(_)
                | Value::Int(_)
                | Value::BigInt(_)
                | Value::Float(_)
                | Value::Double(_)
                | Value::Decimal(_)
        )
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Decimal(s) => {
                let canonical = normalize_decimal(s)?;
                canonical.parse().ok()
            }
            _ => None,
        }
    }

    /// Try to convert this value to a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to convert this value to a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The type-insensitive normal form used for key comparison and hashing.
    pub fn canonical(&self) -> CanonicalValue {
        match self {
            Value::Null => CanonicalValue::Null,
            Value::Bool(v) => CanonicalValue::Bool(*v),
            Value::TinyInt(v) => CanonicalValue::Number(v.to_string()),
            Value::SmallInt(v) => CanonicalValue::Number(v.to_string()),
            Value::Int(v) => CanonicalValue::Number(v.to_string()),
            Value::BigInt(v) => CanonicalValue::Number(v.to_string()),
            Value::Float(v) => canonical_float(f64::from(*v)),
            Value::Double(v) => canonical_float(*v),
            Value::Decimal(s) => match normalize_decimal(s) {
                Some(n) => CanonicalValue::Number(n),
                None => CanonicalValue::RawNumber(s.clone()),
            },
            Value::Text(s) => CanonicalValue::Text(s.clone()),
            Value::Bytes(b) => CanonicalValue::Bytes(b.clone()),
            Value::Date(d) => CanonicalValue::Date(*d),
            Value::Time(t) => CanonicalValue::Time(*t),
            Value::Timestamp(t) => CanonicalValue::Timestamp(*t),
            Value::Uuid(u) => CanonicalValue::Uuid(*u),
            Value::Json(j) => CanonicalValue::Json(j.to_string()),
        }
    }

    /// Numeric-type-insensitive equality.
    ///
    /// `Int(1).key_eq(&Decimal("1.00".into()))` is `true`.
    pub fn key_eq(&self, other: &Value) -> bool {
        if self.is_numeric() != other.is_numeric() {
            return false;
        }
        self.canonical() == other.canonical()
    }
}

fn canonical_float(v: f64) -> CanonicalValue {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 {
        #[allow(clippy::cast_possible_truncation)]
        let whole = v as i64;
        return CanonicalValue::Number(whole.to_string());
    }
    let text = v.to_string();
    match normalize_decimal(&text) {
        Some(n) => CanonicalValue::Number(n),
        None => CanonicalValue::RawNumber(text),
    }
}

/// Normalize a decimal literal: drop a leading `+`, leading zeros of the
/// integral part and trailing zeros of the fraction. `-0` becomes `0`.
fn normalize_decimal(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let (negative, digits) = match trimmed.as_bytes().first()? {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };

    let mut out = String::with_capacity(int_part.len() + frac_part.len() + 2);
    let is_zero = int_part == "0" && frac_part.is_empty();
    if negative && !is_zero {
        out.push('-');
    }
    out.push_str(int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    Some(out)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::TinyInt(v) => write!(f, "{v}"),
            Value::SmallInt(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Date(v) => write!(f, "date:{v}"),
            Value::Time(v) => write!(f, "time:{v}"),
            Value::Timestamp(v) => write!(f, "ts:{v}"),
            Value::Uuid(v) => {
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

use crate::error::{Error, TypeError};

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "i64",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl TryFrom<Value> for i32 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| {
                Error::Type(TypeError {
                    expected: "i32",
                    actual: value.type_name().to_string(),
                    column: None,
                })
            })
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(v) => Ok(v),
            other => match other.as_i64() {
                Some(v) => Ok(v != 0),
                None => Err(Error::Type(TypeError {
                    expected: "bool",
                    actual: other.type_name().to_string(),
                    column: None,
                })),
            },
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s),
            other => Err(Error::Type(TypeError {
                expected: "String",
                actual: other.type_name().to_string(),
                column: None,
            })),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(Error::Type(TypeError {
                expected: "Vec<u8>",
                actual: other.type_name().to_string(),
                column: None,
            })),
        }
    }
}

impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            other => T::try_from(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_widths_compare_equal() {
        assert!(Value::Int(1).key_eq(&Value::BigInt(1)));
        assert!(Value::TinyInt(7).key_eq(&Value::Decimal("7.000".into())));
        assert!(Value::Double(1.0).key_eq(&Value::Decimal("1.00".into())));
        assert!(Value::Decimal("-0.0".into()).key_eq(&Value::Int(0)));
        assert!(!Value::Int(1).key_eq(&Value::Int(2)));
    }

    #[test]
    fn numbers_never_equal_text() {
        assert!(!Value::Int(42).key_eq(&Value::Text("42".into())));
        assert_ne!(Value::Int(42).canonical(), Value::Text("42".into()).canonical());
    }

    #[test]
    fn malformed_decimals_stay_apart_from_text() {
        let decimal = Value::Decimal("abc".into());
        let text = Value::Text("abc".into());
        assert_eq!(decimal.canonical(), CanonicalValue::RawNumber("abc".into()));
        assert_ne!(decimal.canonical(), text.canonical());
        assert!(decimal.key_eq(&Value::Decimal("abc".into())));
        assert_ne!(Value::Double(f64::NAN).canonical(), Value::Text("NaN".into()).canonical());
    }

    #[test]
    fn decimal_normalization() {
        assert_eq!(normalize_decimal("0012.3400"), Some("12.34".to_string()));
        assert_eq!(normalize_decimal("+.5"), Some("0.5".to_string()));
        assert_eq!(normalize_decimal("-000"), Some("0".to_string()));
        assert_eq!(normalize_decimal("1e5"), None);
        assert_eq!(normalize_decimal("."), None);
    }

    #[test]
    fn fractional_float_matches_decimal() {
        assert!(Value::Double(2.5).key_eq(&Value::Decimal("2.50".into())));
        assert!(!Value::Double(2.5).key_eq(&Value::Int(2)));
    }

    #[test]
    fn try_from_conversions() {
        assert_eq!(i64::try_from(Value::Int(5)).unwrap(), 5);
        assert_eq!(i64::try_from(Value::Decimal("12.0".into())).unwrap(), 12);
        assert!(i64::try_from(Value::Text("x".into())).is_err());
        assert_eq!(
            Option::<String>::try_from(Value::Null).unwrap(),
            None::<String>
        );
        assert!(bool::try_from(Value::Int(1)).unwrap());
    }
}
