//! Row hashing and order-insensitive table digests.
//!
//! Each row is hashed with SHA-256 over its [canonical](canonical) key and
//! value encodings. A [`TableDigest`] is the row count plus the 256-bit
//! wrapping sum of all row hashes. Addition is associative and commutative,
//! so the digest of a table equals the combination of the digests of any
//! partition of it: chunked and single-pass checksums agree for every chunk
//! size, and incremental digests accumulate as `previous + delta`.

pub mod canonical;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::core::SqlValue;
use crate::error::{ReconcileError, Result};

use canonical::{encode_value, KEY_SEPARATOR};

/// Reusable row hasher for rows whose first `key_len` values are the key.
#[derive(Debug)]
pub struct RowHasher {
    key_len: usize,
    buf: Vec<u8>,
}

impl RowHasher {
    pub fn new(key_len: usize) -> Self {
        Self {
            key_len,
            buf: Vec::with_capacity(256),
        }
    }

    /// SHA-256 of `key ‖ 0xFF ‖ values`.
    pub fn hash_row(&mut self, row: &[SqlValue]) -> [u8; 32] {
        self.buf.clear();
        let split = self.key_len.min(row.len());
        for value in &row[..split] {
            encode_value(value, &mut self.buf);
        }
        self.buf.push(KEY_SEPARATOR);
        for value in &row[split..] {
            encode_value(value, &mut self.buf);
        }
        Sha256::digest(&self.buf).into()
    }
}

/// Order-insensitive digest of a set of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TableDigest {
    rows: u64,
    sum: [u8; 32],
}

impl TableDigest {
    /// Digest of the empty row set.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn sum_hex(&self) -> String {
        hex::encode(self.sum)
    }

    /// Fold in one row hash.
    pub fn add_hash(&mut self, hash: &[u8; 32]) {
        self.rows = self.rows.wrapping_add(1);
        add_le(&mut self.sum, hash);
    }

    /// Fold in another digest (e.g. a chunk or an incremental delta).
    pub fn combine(&mut self, other: &TableDigest) {
        self.rows = self.rows.wrapping_add(other.rows);
        add_le(&mut self.sum, &other.sum);
    }

    pub fn combined(mut self, other: &TableDigest) -> TableDigest {
        self.combine(other);
        self
    }

    /// Digest of `rows` hashed with `key_len` key columns.
    pub fn of_rows<'a, I>(key_len: usize, rows: I) -> TableDigest
    where
        I: IntoIterator<Item = &'a [SqlValue]>,
    {
        let mut hasher = RowHasher::new(key_len);
        let mut digest = TableDigest::empty();
        for row in rows {
            digest.add_hash(&hasher.hash_row(row));
        }
        digest
    }
}

/// 256-bit little-endian wrapping addition.
fn add_le(acc: &mut [u8; 32], other: &[u8; 32]) {
    let mut carry = 0u16;
    for (a, b) in acc.iter_mut().zip(other.iter()) {
        let s = u16::from(*a) + u16::from(*b) + carry;
        *a = s as u8;
        carry = s >> 8;
    }
}

impl fmt::Display for TableDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.rows, self.sum_hex())
    }
}

impl FromStr for TableDigest {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ReconcileError::Checkpoint(format!("invalid digest '{}'", s));
        let (rows, sum) = s.split_once(':').ok_or_else(invalid)?;
        let rows = rows.parse::<u64>().map_err(|_| invalid())?;
        let bytes = hex::decode(sum).map_err(|_| invalid())?;
        let sum: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self { rows, sum })
    }
}

impl Serialize for TableDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TableDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
