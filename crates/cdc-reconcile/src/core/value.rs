//! SQL value types shared by every backend.
//!
//! [`SqlValue`] is what a backend decodes from a result row. [`KeyValue`] is
//! the totally ordered subset usable in primary keys and watermarks, and
//! [`RowKey`] is a (possibly composite) primary key.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReconcileError, Result};

/// A decoded row: key columns first, in key order, then value columns.
pub type Row = Vec<SqlValue>;

/// SQL value decoded from a backend row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,

    /// Boolean value (bit / boolean).
    Bool(bool),

    /// 16-bit signed integer (tinyint / smallint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real / float4).
    F32(f32),

    /// 64-bit floating point (float / float8).
    F64(f64),

    /// Text data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UUID / uniqueidentifier.
    Uuid(Uuid),

    /// Exact numeric (decimal, numeric, money).
    Decimal(Decimal),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Interpret the value as a soft-delete flag.
    ///
    /// NULL, false and zero are "not deleted"; anything else is set.
    pub fn is_truthy(&self) -> bool {
        match self {
            SqlValue::Null => false,
            SqlValue::Bool(b) => *b,
            SqlValue::I16(v) => *v != 0,
            SqlValue::I32(v) => *v != 0,
            SqlValue::I64(v) => *v != 0,
            SqlValue::Decimal(d) => !d.is_zero(),
            _ => true,
        }
    }

    /// Convert to a key value. NULLs and floating point values cannot be keys.
    pub fn to_key(&self) -> Result<KeyValue> {
        let key = match self {
            SqlValue::Bool(b) => KeyValue::Int(i64::from(*b)),
            SqlValue::I16(v) => KeyValue::Int(i64::from(*v)),
            SqlValue::I32(v) => KeyValue::Int(i64::from(*v)),
            SqlValue::I64(v) => KeyValue::Int(*v),
            SqlValue::Text(s) => KeyValue::Text(s.clone()),
            SqlValue::Bytes(b) => KeyValue::Bytes(b.clone()),
            SqlValue::Uuid(u) => KeyValue::Uuid(*u),
            SqlValue::Decimal(d) => KeyValue::Decimal(d.normalize()),
            SqlValue::DateTime(dt) => KeyValue::DateTime(*dt),
            SqlValue::DateTimeOffset(dt) => KeyValue::DateTime(dt.naive_utc()),
            SqlValue::Date(d) => KeyValue::Date(*d),
            SqlValue::Time(t) => KeyValue::Time(*t),
            SqlValue::Null => {
                return Err(ReconcileError::query(
                    "engine",
                    "NULL value in key or watermark column",
                ))
            }
            SqlValue::F32(_) | SqlValue::F64(_) => {
                return Err(ReconcileError::Config(
                    "floating point columns cannot be used as keys or watermarks".into(),
                ))
            }
        };
        Ok(key)
    }
}

impl From<KeyValue> for SqlValue {
    fn from(key: KeyValue) -> Self {
        match key {
            KeyValue::Int(v) => SqlValue::I64(v),
            KeyValue::Decimal(d) => SqlValue::Decimal(d),
            KeyValue::Text(s) => SqlValue::Text(s),
            KeyValue::Uuid(u) => SqlValue::Uuid(u),
            KeyValue::DateTime(dt) => SqlValue::DateTime(dt),
            KeyValue::Date(d) => SqlValue::Date(d),
            KeyValue::Time(t) => SqlValue::Time(t),
            KeyValue::Bytes(b) => SqlValue::Bytes(b),
        }
    }
}

/// Totally ordered value usable as a primary key component or watermark.
///
/// Serialized with an explicit tag so checkpoints round-trip through JSON
/// without losing the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KeyValue {
    Int(i64),
    Decimal(Decimal),
    Text(String),
    Uuid(Uuid),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Bytes(Vec<u8>),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Decimal(d) => write!(f, "{}", d),
            KeyValue::Text(s) => write!(f, "'{}'", s),
            KeyValue::Uuid(u) => write!(f, "{}", u),
            KeyValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.6f")),
            KeyValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            KeyValue::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.6f")),
            KeyValue::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

/// Primary key of one row; composite keys compare lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(pub Vec<KeyValue>);

impl RowKey {
    pub fn single(value: KeyValue) -> Self {
        RowKey(vec![value])
    }

    /// Build a key from the first `key_len` values of a decoded row.
    pub fn from_row(row: &[SqlValue], key_len: usize) -> Result<Self> {
        if row.len() < key_len {
            return Err(ReconcileError::query(
                "engine",
                format!("row has {} columns, expected at least {}", row.len(), key_len),
            ));
        }
        row[..key_len]
            .iter()
            .map(SqlValue::to_key)
            .collect::<Result<Vec<_>>>()
            .map(RowKey)
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "{}", self.0[0]);
        }
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths_share_key_domain() {
        assert_eq!(SqlValue::I16(7).to_key().unwrap(), KeyValue::Int(7));
        assert_eq!(SqlValue::I32(7).to_key().unwrap(), KeyValue::Int(7));
        assert_eq!(SqlValue::I64(7).to_key().unwrap(), KeyValue::Int(7));
        assert_eq!(SqlValue::Bool(true).to_key().unwrap(), KeyValue::Int(1));
    }

    #[test]
    fn test_null_and_float_rejected_as_key() {
        assert!(SqlValue::Null.to_key().is_err());
        assert!(SqlValue::F64(1.5).to_key().is_err());
    }

    #[test]
    fn test_offset_timestamps_key_in_utc() {
        let dt = DateTime::parse_from_rfc3339("2024-03-01T12:00:00+02:00").unwrap();
        let key = SqlValue::DateTimeOffset(dt).to_key().unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(key, KeyValue::DateTime(expected));
    }

    #[test]
    fn test_composite_key_ordering() {
        let a = RowKey(vec![KeyValue::Int(1), KeyValue::Text("b".into())]);
        let b = RowKey(vec![KeyValue::Int(1), KeyValue::Text("c".into())]);
        let c = RowKey(vec![KeyValue::Int(2), KeyValue::Text("a".into())]);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "(1, 'b')");
    }

    #[test]
    fn test_key_from_row() {
        let row = vec![SqlValue::I32(5), SqlValue::Text("x".into()), SqlValue::Null];
        let key = RowKey::from_row(&row, 2).unwrap();
        assert_eq!(key, RowKey(vec![KeyValue::Int(5), KeyValue::Text("x".into())]));
        assert!(RowKey::from_row(&row, 4).is_err());
    }

    #[test]
    fn test_key_value_json_round_trip() {
        let key = KeyValue::Uuid(Uuid::nil());
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"type":"uuid","value":"00000000-0000-0000-0000-000000000000"}"#);
        let back: KeyValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_soft_delete_truthiness() {
        assert!(!SqlValue::Null.is_truthy());
        assert!(!SqlValue::Bool(false).is_truthy());
        assert!(!SqlValue::I32(0).is_truthy());
        assert!(SqlValue::I16(1).is_truthy());
        assert!(SqlValue::Bool(true).is_truthy());
    }
}
