//! Checks and delimiting for schema, table and column names.
//!
//! Names reach SQL text straight from the YAML config because drivers only
//! bind values. [`validate_identifier`] gates every name before a dialect
//! wraps it in delimiters.

use std::collections::HashSet;

use crate::error::{ReconcileError, Result};

/// SQL Server's `sysname` limit. PostgreSQL truncates at 63 bytes, which
/// would only make lookups miss, so the wider bound applies to both.
const MAX_NAME_BYTES: usize = 128;

/// Rejects names that cannot be delimited safely.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ReconcileError::Config("empty identifier in config".into()));
    }
    if name.contains('\0') {
        return Err(ReconcileError::Config(format!(
            "identifier {:?} contains a null byte",
            name
        )));
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(ReconcileError::Config(format!(
            "identifier {:?} is {} bytes, maximum length is {}",
            name,
            name.len(),
            MAX_NAME_BYTES
        )));
    }
    Ok(())
}

/// Validates each column and rejects case-insensitive repeats, which would
/// feed the same value into a row hash twice.
pub fn validate_columns(context: &str, columns: &[String]) -> Result<()> {
    let mut seen = HashSet::with_capacity(columns.len());
    for column in columns {
        validate_identifier(column)?;
        if !seen.insert(column.to_lowercase()) {
            return Err(ReconcileError::Config(format!(
                "{}: column {:?} listed more than once",
                context, column
            )));
        }
    }
    Ok(())
}

fn delimit(name: &str, open: char, close: char) -> Result<String> {
    validate_identifier(name)?;
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push(open);
    for ch in name.chars() {
        if ch == close {
            quoted.push(close);
        }
        quoted.push(ch);
    }
    quoted.push(close);
    Ok(quoted)
}

/// `"name"`, with embedded double quotes doubled.
pub fn quote_pg(name: &str) -> Result<String> {
    delimit(name, '"', '"')
}

/// `[name]`, with embedded closing brackets doubled.
pub fn quote_mssql(name: &str) -> Result<String> {
    delimit(name, '[', ']')
}
