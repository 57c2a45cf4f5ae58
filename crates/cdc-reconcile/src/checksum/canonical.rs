//! Canonical byte encoding of SQL values.
//!
//! Both backends decode into [`SqlValue`] and hash the bytes produced here,
//! so two databases holding the same logical value hash identically even
//! when their drivers deliver different native types.
//!
//! Encoding: one tag byte, then (except for NULL) a little-endian `u32`
//! payload length and the payload.
//!
//! | value | tag | payload |
//! |---|---|---|
//! | NULL | `0x00` | none |
//! | integer, bit, bool | `I` | decimal digits of the i64 |
//! | decimal / numeric / money | `N` | normalized decimal (`1.50` -> `1.5`, `-0` -> `0`) |
//! | float, real | `F` | shortest round-trip digits, `NaN`, `inf`, `-0` -> `0` |
//! | text | `S` | UTF-8 with CRLF -> LF |
//! | binary | `B` | raw bytes |
//! | uuid | `U` | lowercase hyphenated |
//! | timestamp | `T` | UTC, truncated to microseconds, `%Y-%m-%dT%H:%M:%S%.6f` |
//! | date | `D` | `%Y-%m-%d` |
//! | time | `t` | `%H:%M:%S%.6f` |
//!
//! Naive timestamps are taken to be UTC.

use crate::core::SqlValue;

pub const TAG_NULL: u8 = 0x00;
pub const TAG_INT: u8 = b'I';
pub const TAG_DECIMAL: u8 = b'N';
pub const TAG_FLOAT: u8 = b'F';
pub const TAG_TEXT: u8 = b'S';
pub const TAG_BYTES: u8 = b'B';
pub const TAG_UUID: u8 = b'U';
pub const TAG_TIMESTAMP: u8 = b'T';
pub const TAG_DATE: u8 = b'D';
pub const TAG_TIME: u8 = b't';

/// Separates key columns from value columns inside a row hash.
pub const KEY_SEPARATOR: u8 = 0xFF;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const TIME_FORMAT: &str = "%H:%M:%S%.6f";

fn put(buf: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    buf.push(tag);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == 0.0 {
        "0".to_string()
    } else {
        v.to_string()
    }
}

/// Append the canonical encoding of `value` to `buf`.
pub fn encode_value(value: &SqlValue, buf: &mut Vec<u8>) {
    match value {
        SqlValue::Null => buf.push(TAG_NULL),
        SqlValue::Bool(b) => put(buf, TAG_INT, if *b { b"1" } else { b"0" }),
        SqlValue::I16(v) => put(buf, TAG_INT, v.to_string().as_bytes()),
        SqlValue::I32(v) => put(buf, TAG_INT, v.to_string().as_bytes()),
        SqlValue::I64(v) => put(buf, TAG_INT, v.to_string().as_bytes()),
        SqlValue::Decimal(d) => put(buf, TAG_DECIMAL, d.normalize().to_string().as_bytes()),
        // f32 digits are its own shortest form, not the widened f64's
        SqlValue::F32(v) => {
            let text = if v.is_nan() {
                "NaN".to_string()
            } else if *v == 0.0 {
                "0".to_string()
            } else {
                v.to_string()
            };
            put(buf, TAG_FLOAT, text.as_bytes())
        }
        SqlValue::F64(v) => put(buf, TAG_FLOAT, float_text(*v).as_bytes()),
        SqlValue::Text(s) => {
            if s.contains("\r\n") {
                put(buf, TAG_TEXT, s.replace("\r\n", "\n").as_bytes())
            } else {
                put(buf, TAG_TEXT, s.as_bytes())
            }
        }
        SqlValue::Bytes(b) => put(buf, TAG_BYTES, b),
        SqlValue::Uuid(u) => put(buf, TAG_UUID, u.hyphenated().to_string().as_bytes()),
        SqlValue::DateTime(dt) => put(buf, TAG_TIMESTAMP, dt.format(TIMESTAMP_FORMAT).to_string().as_bytes()),
        SqlValue::DateTimeOffset(dt) => put(
            buf,
            TAG_TIMESTAMP,
            dt.naive_utc().format(TIMESTAMP_FORMAT).to_string().as_bytes(),
        ),
        SqlValue::Date(d) => put(buf, TAG_DATE, d.format("%Y-%m-%d").to_string().as_bytes()),
        SqlValue::Time(t) => put(buf, TAG_TIME, t.format(TIME_FORMAT).to_string().as_bytes()),
    }
}

/// Canonical encoding of a single value.
pub fn encode(value: &SqlValue) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(value, &mut buf);
    buf
}
