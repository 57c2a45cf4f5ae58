//! Core types shared across the engine.
//!
//! - [`identifier`]: identifier validation and quoting
//! - [`table`]: table identity, keys, soft-delete and watermark settings
//! - [`value`]: decoded SQL values, key values and composite row keys

pub mod identifier;
pub mod table;
pub mod value;

pub use table::{ColumnInfo, KeyKind, SoftDelete, SoftDeleteStyle, TableRef, TableSpec};
pub use value::{KeyValue, Row, RowKey, SqlValue};
