//! Structured description of the reads the engine issues.
//!
//! Every backend read is a [`ScanRequest`]: a key range, an optional
//! soft-delete filter and an optional watermark window over one table.
//! SQL backends render it through a [`Dialect`](super::Dialect); the
//! in-memory backend evaluates it directly.

use crate::core::{KeyKind, KeyValue, RowKey, SoftDelete, TableRef};

/// Half-open primary-key range `(lower, upper]`. `None` is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    /// Exclusive lower bound.
    pub lower: Option<RowKey>,
    /// Inclusive upper bound.
    pub upper: Option<RowKey>,
}

impl KeyRange {
    /// The whole key domain.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(lower: Option<RowKey>, upper: Option<RowKey>) -> Self {
        Self { lower, upper }
    }

    pub fn is_full(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        if let Some(lower) = &self.lower {
            if key <= lower {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if key > upper {
                return false;
            }
        }
        true
    }

    /// Split at `pivot` into `(lower, pivot]` and `(pivot, upper]`.
    pub fn split_at(&self, pivot: &RowKey) -> (KeyRange, KeyRange) {
        (
            KeyRange::new(self.lower.clone(), Some(pivot.clone())),
            KeyRange::new(Some(pivot.clone()), self.upper.clone()),
        )
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.lower {
            Some(k) => write!(f, "({}", k)?,
            None => write!(f, "(-inf")?,
        }
        match &self.upper {
            Some(k) => write!(f, ", {}]", k),
            None => write!(f, ", +inf)"),
        }
    }
}

/// Incremental window `after < column <= up_to` over a watermark column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub column: String,
    pub after: Option<KeyValue>,
    pub up_to: Option<KeyValue>,
}

impl Window {
    pub fn contains(&self, value: &KeyValue) -> bool {
        if let Some(after) = &self.after {
            if value <= after {
                return false;
            }
        }
        if let Some(up_to) = &self.up_to {
            if value > up_to {
                return false;
            }
        }
        true
    }
}

/// A read over one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub table: TableRef,
    /// Key columns; always projected first and used for ordering.
    pub key_columns: Vec<String>,
    /// Comparison class per key column; missing entries are ordinal.
    pub key_kinds: Vec<KeyKind>,
    /// Value columns projected after the key.
    pub value_columns: Vec<String>,
    pub range: KeyRange,
    /// When set, rows whose marker is set are excluded.
    pub soft_delete: Option<SoftDelete>,
    pub window: Option<Window>,
}

impl ScanRequest {
    pub fn new(table: TableRef, key_columns: Vec<String>, value_columns: Vec<String>) -> Self {
        Self {
            table,
            key_columns,
            key_kinds: Vec::new(),
            value_columns,
            range: KeyRange::full(),
            soft_delete: None,
            window: None,
        }
    }

    pub fn with_key_kinds(mut self, kinds: Vec<KeyKind>) -> Self {
        self.key_kinds = kinds;
        self
    }

    pub fn key_kind(&self, index: usize) -> KeyKind {
        self.key_kinds.get(index).copied().unwrap_or_default()
    }

    pub fn with_range(mut self, range: KeyRange) -> Self {
        self.range = range;
        self
    }

    pub fn excluding_deleted(mut self, soft_delete: Option<SoftDelete>) -> Self {
        self.soft_delete = soft_delete;
        self
    }

    pub fn with_window(mut self, window: Option<Window>) -> Self {
        self.window = window;
        self
    }

    /// Same request restricted to a different key range.
    pub fn in_range(&self, range: KeyRange) -> Self {
        let mut req = self.clone();
        req.range = range;
        req
    }

    /// Same request projecting only the key.
    pub fn keys_only(&self) -> Self {
        let mut req = self.clone();
        req.value_columns.clear();
        req
    }

    /// All projected columns in order.
    pub fn projection(&self) -> impl Iterator<Item = &String> {
        self.key_columns.iter().chain(self.value_columns.iter())
    }
}

/// SQL text plus the values bound to its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<KeyValue>,
}

impl RenderedQuery {
    pub fn new(sql: String, params: Vec<KeyValue>) -> Self {
        Self { sql, params }
    }
}
