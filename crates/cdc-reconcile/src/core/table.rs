//! Table identity and per-table reconciliation settings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::identifier::{validate_columns, validate_identifier};
use crate::error::{ReconcileError, Result};

/// Physical location of a table on one backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// How a soft-delete marker column flags a deleted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftDeleteStyle {
    /// Boolean or integer flag; non-zero means deleted.
    #[default]
    Flag,
    /// Nullable timestamp (e.g. `deleted_at`); non-NULL means deleted.
    Timestamp,
}

/// Soft-delete marker of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftDelete {
    pub column: String,
    #[serde(default)]
    pub style: SoftDeleteStyle,
}

/// Comparison class of a key column.
///
/// [`RowKey`](crate::core::RowKey) orders text by code point and UUIDs by
/// their canonical bytes. Native collations disagree (SQL Server's default
/// is case-insensitive and it sorts `uniqueidentifier` by its last group
/// first), so dialects render these columns in a binary order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyKind {
    /// Numeric, temporal and binary columns.
    #[default]
    Ordinal,
    Text,
    Uuid,
}

impl KeyKind {
    /// Classify an `INFORMATION_SCHEMA.COLUMNS.DATA_TYPE` value.
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type.trim().to_ascii_lowercase().as_str() {
            "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" | "sysname"
            | "character" | "character varying" | "bpchar" | "name" => KeyKind::Text,
            "uniqueidentifier" | "uuid" => KeyKind::Uuid,
            _ => KeyKind::Ordinal,
        }
    }
}

/// Catalog entry for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    pub fn key_kind(&self) -> KeyKind {
        KeyKind::from_data_type(&self.data_type)
    }
}

/// Immutable description of one replicated table.
///
/// The source side is `schema.name`; the target side defaults to the same
/// name under the target connection's schema unless overridden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Source schema. Defaults to the source connection schema when omitted.
    #[serde(default)]
    pub schema: Option<String>,

    /// Table name.
    pub name: String,

    /// Primary-key column(s), in key order.
    pub primary_key: Vec<String>,

    /// Columns to compare besides the key. Empty means all source columns.
    #[serde(default)]
    pub columns: Vec<String>,

    /// Optional soft-delete marker.
    #[serde(default)]
    pub soft_delete: Option<SoftDelete>,

    /// Column used as incremental watermark. Defaults to a single-column key.
    #[serde(default)]
    pub watermark_column: Option<String>,

    /// Target schema override.
    #[serde(default)]
    pub target_schema: Option<String>,

    /// Target table name override.
    #[serde(default)]
    pub target_name: Option<String>,
}

impl TableSpec {
    /// Minimal spec with a single key column.
    pub fn new(schema: &str, name: &str, primary_key: &[&str]) -> Self {
        Self {
            schema: Some(schema.to_string()),
            name: name.to_string(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            columns: Vec::new(),
            soft_delete: None,
            watermark_column: None,
            target_schema: None,
            target_name: None,
        }
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_soft_delete(mut self, column: &str, style: SoftDeleteStyle) -> Self {
        self.soft_delete = Some(SoftDelete {
            column: column.to_string(),
            style,
        });
        self
    }

    pub fn with_watermark(mut self, column: &str) -> Self {
        self.watermark_column = Some(column.to_string());
        self
    }

    pub fn with_target(mut self, schema: &str, name: &str) -> Self {
        self.target_schema = Some(schema.to_string());
        self.target_name = Some(name.to_string());
        self
    }

    /// Source location, falling back to the connection's default schema.
    pub fn source_ref(&self, default_schema: &str) -> TableRef {
        TableRef::new(
            self.schema.as_deref().unwrap_or(default_schema),
            self.name.clone(),
        )
    }

    /// Target location, falling back to the connection's default schema.
    pub fn target_ref(&self, default_schema: &str) -> TableRef {
        TableRef::new(
            self.target_schema.as_deref().unwrap_or(default_schema),
            self.target_name.as_deref().unwrap_or(&self.name),
        )
    }

    /// Identity used for checkpoints, logs and reports.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }

    /// Column driving incremental windows.
    pub fn effective_watermark(&self) -> Result<&str> {
        if let Some(col) = &self.watermark_column {
            return Ok(col);
        }
        match self.primary_key.as_slice() {
            [single] => Ok(single),
            _ => Err(ReconcileError::Config(format!(
                "{}: incremental mode with a composite key requires watermark_column",
                self.qualified_name()
            ))),
        }
    }

    /// Compared value columns: configured or discovered columns minus key columns.
    pub fn value_columns(&self, discovered: &[String]) -> Vec<String> {
        let base = if self.columns.is_empty() {
            discovered
        } else {
            self.columns.as_slice()
        };
        base.iter()
            .filter(|c| {
                !self
                    .primary_key
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(c.as_str()))
            })
            .cloned()
            .collect()
    }

    /// Comparison class of each key column, looked up in `columns`.
    /// Columns missing from the catalog compare natively.
    pub fn key_kinds(&self, columns: &[ColumnInfo]) -> Vec<KeyKind> {
        self.primary_key
            .iter()
            .map(|k| {
                columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(k))
                    .map(ColumnInfo::key_kind)
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Validate names and key presence.
    pub fn validate(&self) -> Result<()> {
        let context = self.qualified_name();
        if let Some(schema) = &self.schema {
            validate_identifier(schema)?;
        }
        validate_identifier(&self.name)?;
        if self.primary_key.is_empty() {
            return Err(ReconcileError::Config(format!(
                "{}: primary_key must name at least one column",
                context
            )));
        }
        validate_columns(&context, &self.primary_key)?;
        validate_columns(&context, &self.columns)?;
        if let Some(sd) = &self.soft_delete {
            validate_identifier(&sd.column)?;
        }
        if let Some(wm) = &self.watermark_column {
            validate_identifier(wm)?;
        }
        if let Some(schema) = &self.target_schema {
            validate_identifier(schema)?;
        }
        if let Some(name) = &self.target_name {
            validate_identifier(name)?;
        }
        Ok(())
    }
}
