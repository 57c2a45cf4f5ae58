//! Row-level localization of checksum mismatches.
//!
//! [`RowLevelReconciler::localize`] bisects the primary-key domain: a range
//! whose counts and digests agree on both sides is dropped, a range small
//! enough to enumerate is fetched and diffed row by row, and anything else
//! is split at the median key of its larger side. Only divergent ranges are
//! ever transferred in full.

pub mod repair;

use std::cmp::Ordering;

use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::checksum::RowHasher;
use crate::compare::{self, ComparisonResult, TablePlan};
use crate::core::{Row, RowKey};
use crate::error::Result;
use crate::pool::Session;

pub use repair::{generate_repair_script, RepairAction, RepairScript, RepairStatement};

/// Kind of divergence between source and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    MissingInTarget,
    MissingInSource,
    ValueMismatch,
    CountMismatch,
}

impl DiscrepancyKind {
    pub fn severity(self) -> Severity {
        match self {
            DiscrepancyKind::CountMismatch | DiscrepancyKind::MissingInTarget => Severity::High,
            DiscrepancyKind::MissingInSource | DiscrepancyKind::ValueMismatch => Severity::Medium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiscrepancyKind::MissingInTarget => "missing_in_target",
            DiscrepancyKind::MissingInSource => "missing_in_source",
            DiscrepancyKind::ValueMismatch => "value_mismatch",
            DiscrepancyKind::CountMismatch => "count_mismatch",
        }
    }
}

impl std::fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

/// One divergence found by a comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub table: String,
    pub kind: DiscrepancyKind,
    /// Divergent key; `None` for table-level count mismatches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<RowKey>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Source row (key then value columns) used to build upserts.
    #[serde(skip)]
    pub source_row: Option<Row>,
}

impl Discrepancy {
    fn keyed(table: &str, kind: DiscrepancyKind, key: RowKey, source_row: Option<Row>) -> Self {
        Self {
            table: table.to_string(),
            kind,
            key: Some(key),
            severity: kind.severity(),
            detail: None,
            source_row,
        }
    }

    pub fn missing_in_target(table: &str, key: RowKey, source_row: Row) -> Self {
        Self::keyed(table, DiscrepancyKind::MissingInTarget, key, Some(source_row))
    }

    pub fn missing_in_source(table: &str, key: RowKey) -> Self {
        Self::keyed(table, DiscrepancyKind::MissingInSource, key, None)
    }

    pub fn value_mismatch(table: &str, key: RowKey, source_row: Row) -> Self {
        Self::keyed(table, DiscrepancyKind::ValueMismatch, key, Some(source_row))
    }

    /// Table-level count difference taken from a comparison result.
    pub fn count_mismatch(result: &ComparisonResult) -> Self {
        Self {
            table: result.table.clone(),
            kind: DiscrepancyKind::CountMismatch,
            key: None,
            severity: DiscrepancyKind::CountMismatch.severity(),
            detail: Some(format!(
                "source={} target={} delta={}",
                result.source_count,
                result.target_count,
                result.row_count_delta()
            )),
            source_row: None,
        }
    }
}

/// Diff two row sets whose first `key_len` values are the key.
///
/// Both sides are re-sorted by [`RowKey`] first, so the rows may arrive in
/// whatever order each backend's collation produced.
pub fn diff_rows(table: &str, key_len: usize, source: Vec<Row>, target: Vec<Row>) -> Result<Vec<Discrepancy>> {
    let mut hasher = RowHasher::new(key_len);
    let mut out = Vec::new();
    let mut source = sorted_by_key(source, key_len)?.into_iter().peekable();
    let mut target = sorted_by_key(target, key_len)?.into_iter().peekable();

    loop {
        let order = match (source.peek(), target.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((s, _)), Some((t, _))) => s.cmp(t),
        };
        match order {
            Ordering::Less => {
                if let Some((key, row)) = source.next() {
                    out.push(Discrepancy::missing_in_target(table, key, row));
                }
            }
            Ordering::Greater => {
                if let Some((key, _)) = target.next() {
                    out.push(Discrepancy::missing_in_source(table, key));
                }
            }
            Ordering::Equal => {
                if let (Some((key, s)), Some((_, t))) = (source.next(), target.next()) {
                    if hasher.hash_row(&s) != hasher.hash_row(&t) {
                        out.push(Discrepancy::value_mismatch(table, key, s));
                    }
                }
            }
        }
    }
    Ok(out)
}

fn sorted_by_key(rows: Vec<Row>, key_len: usize) -> Result<Vec<(RowKey, Row)>> {
    let mut keyed = rows
        .into_iter()
        .map(|row| Ok((RowKey::from_row(&row, key_len)?, row)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed)
}

/// Outcome of localizing one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Localization {
    /// Keyed discrepancies ordered by key.
    pub discrepancies: Vec<Discrepancy>,
    /// Stopped at the discrepancy limit.
    pub truncated: bool,
    pub ranges_compared: u64,
    pub leaves_scanned: u64,
    pub rows_fetched: u64,
}

/// Bisection-based localizer.
#[derive(Debug, Clone)]
pub struct RowLevelReconciler {
    leaf_size: u64,
    max_discrepancies: usize,
}

impl Default for RowLevelReconciler {
    fn default() -> Self {
        Self::new(1000, 10_000)
    }
}

impl RowLevelReconciler {
    /// `leaf_size`: largest range (rows per side) diffed directly.
    pub fn new(leaf_size: usize, max_discrepancies: usize) -> Self {
        Self {
            leaf_size: leaf_size.max(1) as u64,
            max_discrepancies: max_discrepancies.max(1),
        }
    }

    /// Find the divergent keys of `plan` within its key range.
    ///
    /// `known_mismatch` skips re-checksumming the root range when the
    /// caller already saw the digests differ.
    pub async fn localize(
        &self,
        source: &mut Session,
        target: &mut Session,
        plan: &TablePlan,
        known_mismatch: bool,
    ) -> Result<Localization> {
        let span = info_span!("localize", table = %plan.name);
        self.bisect(source, target, plan, known_mismatch)
            .instrument(span)
            .await
    }

    async fn bisect(
        &self,
        source: &mut Session,
        target: &mut Session,
        plan: &TablePlan,
        known_mismatch: bool,
    ) -> Result<Localization> {
        let mut out = Localization::default();
        let key_len = plan.key_columns().len();
        // right halves are pushed first so ranges are visited in key order
        let mut pending = vec![(plan.source.range.clone(), known_mismatch)];

        while let Some((range, skip_checksum)) = pending.pop() {
            let sub = plan.in_range(range.clone());
            out.ranges_compared += 1;

            let (sc, tc) = tokio::join!(
                compare::get_row_count(source, &sub.source),
                compare::get_row_count(target, &sub.target)
            );
            let (sc, tc) = (sc?, tc?);
            if sc == 0 && tc == 0 {
                continue;
            }

            if sc.max(tc) > self.leaf_size {
                if sc == tc && !skip_checksum {
                    let (sd, td) = tokio::join!(
                        compare::calculate_checksum(source, &sub.source),
                        compare::calculate_checksum(target, &sub.target)
                    );
                    if sd? == td? {
                        debug!("{}: range {} matches", plan.name, range);
                        continue;
                    }
                }

                let pivot = if sc >= tc {
                    compare::key_at(source, &sub.source, sc / 2 - 1).await?
                } else {
                    compare::key_at(target, &sub.target, tc / 2 - 1).await?
                };
                if let Some(pivot) = pivot {
                    let (left, right) = range.split_at(&pivot);
                    debug!(
                        "{}: range {} diverges (source={}, target={}), split at {}",
                        plan.name, range, sc, tc, pivot
                    );
                    pending.push((right, false));
                    pending.push((left, false));
                    continue;
                }
                // Rows vanished between count and pivot lookup; diff directly
                warn!("{}: no pivot in {}, diffing range directly", plan.name, range);
            }

            let (rows_s, rows_t) = tokio::join!(
                compare::fetch_rows(source, &sub.source),
                compare::fetch_rows(target, &sub.target)
            );
            let (rows_s, rows_t) = (rows_s?, rows_t?);
            out.leaves_scanned += 1;
            out.rows_fetched += (rows_s.len() + rows_t.len()) as u64;

            let found = diff_rows(&plan.name, key_len, rows_s, rows_t)?;
            let room = self.max_discrepancies - out.discrepancies.len();
            if found.len() >= room {
                out.truncated = found.len() > room || !pending.is_empty();
                out.discrepancies.extend(found.into_iter().take(room));
                if out.truncated {
                    warn!(
                        "{}: stopped after {} discrepancies",
                        plan.name, self.max_discrepancies
                    );
                }
                break;
            }
            out.discrepancies.extend(found);
        }

        out.discrepancies.sort_by(|a, b| a.key.cmp(&b.key));
        info!(
            "{}: localized {} discrepancies ({} ranges, {} leaves, {} rows fetched)",
            plan.name,
            out.discrepancies.len(),
            out.ranges_compared,
            out.leaves_scanned,
            out.rows_fetched
        );
        Ok(out)
    }
}
