//! Repair script generation.
//!
//! Each statement touches exactly one divergent key and is idempotent:
//! deletes of absent rows delete nothing, and upserts overwrite the row with
//! the source values. Applying a script twice leaves the target as applying
//! it once.
//!
//! When the comparison excluded soft-deleted rows, a target row with no live
//! source counterpart is marked deleted instead of removed, which mirrors a
//! source tombstone and hides a hard-deleted row from the next comparison.

use std::fmt::Write as _;

use serde::Serialize;

use super::{Discrepancy, DiscrepancyKind};
use crate::compare::TablePlan;
use crate::core::{RowKey, TableRef};
use crate::dialect::DialectKind;
use crate::error::{ReconcileError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    Delete,
    MarkDeleted,
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairStatement {
    pub key: RowKey,
    pub action: RepairAction,
    pub sql: String,
}

/// Ordered repair statements for one target table.
///
/// Deletes (hard or soft) come first, then upserts; each group is ordered
/// by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairScript {
    pub table: String,
    pub target: TableRef,
    pub dialect: DialectKind,
    pub statements: Vec<RepairStatement>,
}

impl RepairScript {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn count(&self, action: RepairAction) -> usize {
        self.statements.iter().filter(|s| s.action == action).count()
    }

    /// SQL text ready to run against the target.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "-- repair script for {} ({})", self.target, self.dialect);
        let _ = writeln!(
            out,
            "-- {} deletes, {} soft deletes, {} upserts",
            self.count(RepairAction::Delete),
            self.count(RepairAction::MarkDeleted),
            self.count(RepairAction::Upsert)
        );
        for stmt in &self.statements {
            out.push_str(&stmt.sql);
            out.push('\n');
        }
        out
    }
}

/// Build the repair script for `discrepancies` found on `plan`.
///
/// Count-mismatch entries carry no key and are skipped; the keyed entries
/// found by localization already cover them.
pub fn generate_repair_script(
    plan: &TablePlan,
    target_kind: DialectKind,
    discrepancies: &[Discrepancy],
) -> Result<RepairScript> {
    let dialect = target_kind.dialect();
    let target = &plan.target;
    let columns: Vec<String> = target
        .key_columns
        .iter()
        .chain(target.value_columns.iter())
        .cloned()
        .collect();

    let mut deletes = Vec::new();
    let mut upserts = Vec::new();
    for d in discrepancies {
        let key = match &d.key {
            Some(key) => key,
            None => continue,
        };
        match d.kind {
            DiscrepancyKind::MissingInSource => {
                let statement = match &target.soft_delete {
                    Some(sd) => RepairStatement {
                        key: key.clone(),
                        action: RepairAction::MarkDeleted,
                        sql: dialect.build_mark_deleted(&target.table, &target.key_columns, key, sd)?,
                    },
                    None => RepairStatement {
                        key: key.clone(),
                        action: RepairAction::Delete,
                        sql: dialect.build_delete(&target.table, &target.key_columns, key)?,
                    },
                };
                deletes.push(statement);
            }
            DiscrepancyKind::MissingInTarget | DiscrepancyKind::ValueMismatch => {
                let row = d.source_row.as_ref().ok_or_else(|| {
                    ReconcileError::query(
                        dialect.name(),
                        format!("{}: no source row for key {}", plan.name, key),
                    )
                })?;
                let sql = dialect.build_upsert(&target.table, &target.key_columns, &columns, row)?;
                upserts.push(RepairStatement {
                    key: key.clone(),
                    action: RepairAction::Upsert,
                    sql,
                });
            }
            DiscrepancyKind::CountMismatch => {}
        }
    }

    deletes.sort_by(|a, b| a.key.cmp(&b.key));
    upserts.sort_by(|a, b| a.key.cmp(&b.key));
    deletes.dedup_by(|a, b| a.key == b.key);
    upserts.dedup_by(|a, b| a.key == b.key);

    let mut statements = deletes;
    statements.extend(upserts);
    Ok(RepairScript {
        table: plan.name.clone(),
        target: target.table.clone(),
        dialect: target_kind,
        statements,
    })
}
