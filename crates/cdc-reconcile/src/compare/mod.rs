//! Row-count and checksum comparison.
//!
//! Every primitive runs through a [`Session`], so each backend call gets the
//! query timeout and retry policy. Mismatches are results, never errors.
//!
//! Chunked checksums walk the key domain with keyset pagination: the key at
//! offset `chunk_size - 1` past the previous boundary closes the next chunk
//! `(previous, boundary]`. Chunk digests are summed, which gives the same
//! digest as a single pass for any chunk size.

use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, debug_span, info, info_span, Instrument};

use crate::checksum::{RowHasher, TableDigest};
use crate::core::{ColumnInfo, KeyKind, KeyValue, Row, RowKey, TableRef, TableSpec};
use crate::dialect::{KeyRange, ScanRequest, Window};
use crate::error::Result;
use crate::pool::Session;

/// Resolved reads for one table on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    /// Table identity used in logs, reports and checkpoints (`schema.table` on the source).
    pub name: String,
    pub source: ScanRequest,
    pub target: ScanRequest,
    /// Watermark column for incremental windows.
    pub watermark: Option<String>,
}

impl TablePlan {
    /// Plan reads for `spec` comparing `value_columns` besides the key.
    pub fn new(
        spec: &TableSpec,
        source_schema: &str,
        target_schema: &str,
        value_columns: Vec<String>,
        include_soft_deleted: bool,
    ) -> Self {
        let source_ref = spec.source_ref(source_schema);
        let soft_delete = if include_soft_deleted {
            None
        } else {
            spec.soft_delete.clone()
        };
        let request = |table: TableRef| {
            ScanRequest::new(table, spec.primary_key.clone(), value_columns.clone())
                .excluding_deleted(soft_delete.clone())
        };
        Self {
            name: source_ref.to_string(),
            source: request(source_ref),
            target: request(spec.target_ref(target_schema)),
            watermark: spec.effective_watermark().ok().map(str::to_string),
        }
    }

    pub fn key_columns(&self) -> &[String] {
        &self.source.key_columns
    }

    /// Same plan with key columns compared by `kinds` on both sides.
    pub fn with_key_kinds(mut self, kinds: Vec<KeyKind>) -> Self {
        self.source = self.source.with_key_kinds(kinds.clone());
        self.target = self.target.with_key_kinds(kinds);
        self
    }

    /// Same plan restricted to `range` on both sides.
    pub fn in_range(&self, range: KeyRange) -> Self {
        Self {
            name: self.name.clone(),
            source: self.source.in_range(range.clone()),
            target: self.target.in_range(range),
            watermark: self.watermark.clone(),
        }
    }

    /// Same plan restricted to a watermark window on both sides.
    pub fn windowed(&self, window: Option<Window>) -> Self {
        Self {
            name: self.name.clone(),
            source: self.source.clone().with_window(window.clone()),
            target: self.target.clone().with_window(window),
            watermark: self.watermark.clone(),
        }
    }
}

/// Comparison switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareOptions {
    /// Compare checksums after counts.
    pub validate_checksum: bool,
    /// Compare checksums even when counts differ.
    pub checksum_even_if_counts_differ: bool,
    /// Rows per checksum chunk; `None` checksums in one pass.
    pub chunk_size: Option<usize>,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            validate_checksum: true,
            checksum_even_if_counts_differ: false,
            chunk_size: None,
        }
    }
}

/// Outcome of comparing one table (or one window of it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonResult {
    pub table: String,
    pub source_count: u64,
    pub target_count: u64,
    pub count_match: bool,
    /// `None` when checksums were not compared.
    pub checksum_match: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_checksum: Option<TableDigest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_checksum: Option<TableDigest>,
    /// Counts match and checksums (if compared) match.
    pub matched: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ComparisonResult {
    pub fn row_count_delta(&self) -> i64 {
        self.source_count as i64 - self.target_count as i64
    }
}

/// Whether two row counts agree.
pub fn compare_row_counts(source: u64, target: u64) -> bool {
    source == target
}

/// Whether two digests agree.
pub fn compare_checksums(source: &TableDigest, target: &TableDigest) -> bool {
    source == target
}

/// Number of rows matched by `req`, soft-delete filter included.
pub async fn get_row_count(session: &mut Session, req: &ScanRequest) -> Result<u64> {
    let req = req.clone();
    session
        .run("row_count", move |c| {
            let req = req.clone();
            async move { c.count(&req).await }.boxed()
        })
        .await
}

/// Single-pass digest of the rows matched by `req`.
///
/// Rows are streamed in key order and folded one at a time.
pub async fn calculate_checksum(session: &mut Session, req: &ScanRequest) -> Result<TableDigest> {
    let req = req.clone();
    session
        .run("checksum", move |c| {
            let req = req.clone();
            async move {
                let mut hasher = RowHasher::new(req.key_columns.len());
                let mut digest = TableDigest::empty();
                c.scan(&req, &mut |row: Row| {
                    digest.add_hash(&hasher.hash_row(&row));
                    Ok(())
                })
                .await?;
                Ok(digest)
            }
            .boxed()
        })
        .await
}

/// Key at zero-based `offset` within `req`, in key order.
pub async fn key_at(session: &mut Session, req: &ScanRequest, offset: u64) -> Result<Option<RowKey>> {
    let req = req.keys_only();
    session
        .run("key_at", move |c| {
            let req = req.clone();
            async move { c.key_at(&req, offset).await }.boxed()
        })
        .await
}

/// Digest of `req` computed over chunks of at most `chunk_size` rows.
pub async fn calculate_checksum_chunked(
    session: &mut Session,
    req: &ScanRequest,
    chunk_size: usize,
) -> Result<TableDigest> {
    let chunk_size = chunk_size.max(1) as u64;
    let mut total = TableDigest::empty();
    let mut lower = req.range.lower.clone();
    let mut index = 0usize;

    loop {
        let remaining = req.in_range(KeyRange::new(lower.clone(), req.range.upper.clone()));
        let boundary = key_at(session, &remaining, chunk_size - 1).await?;
        let range = KeyRange::new(
            lower.clone(),
            boundary.clone().or_else(|| req.range.upper.clone()),
        );

        let span = debug_span!("chunk", table = %req.table, index, range = %range);
        let digest = calculate_checksum(session, &req.in_range(range))
            .instrument(span)
            .await?;
        debug!(
            "{}: chunk {} hashed {} rows",
            req.table,
            index,
            digest.rows()
        );
        total.combine(&digest);
        index += 1;

        match boundary {
            Some(b) if Some(&b) != req.range.upper.as_ref() => lower = Some(b),
            _ => break,
        }
    }
    Ok(total)
}

/// Digest of `req`, chunked when `chunk_size` is set.
pub async fn checksum(session: &mut Session, req: &ScanRequest, chunk_size: Option<usize>) -> Result<TableDigest> {
    match chunk_size {
        Some(size) => calculate_checksum_chunked(session, req, size).await,
        None => calculate_checksum(session, req).await,
    }
}

/// All rows matched by `req`, in key order.
pub async fn fetch_rows(session: &mut Session, req: &ScanRequest) -> Result<Vec<Row>> {
    let req = req.clone();
    session
        .run("fetch_rows", move |c| {
            let req = req.clone();
            async move {
                let mut rows = Vec::new();
                c.scan(&req, &mut |row: Row| {
                    rows.push(row);
                    Ok(())
                })
                .await?;
                Ok(rows)
            }
            .boxed()
        })
        .await
}

/// Largest value of `column`, or `None` when the table has no non-NULL value.
pub async fn max_value(session: &mut Session, table: &TableRef, column: &str) -> Result<Option<KeyValue>> {
    let table = table.clone();
    let column = column.to_string();
    session
        .run("max_watermark", move |c| {
            let table = table.clone();
            let column = column.clone();
            async move { c.max_value(&table, &column).await }.boxed()
        })
        .await
}

/// Columns of `table` in ordinal order.
pub async fn list_columns(session: &mut Session, table: &TableRef) -> Result<Vec<ColumnInfo>> {
    let table = table.clone();
    session
        .run("list_columns", move |c| {
            let table = table.clone();
            async move { c.list_columns(&table).await }.boxed()
        })
        .await
}

/// Count and checksum comparison of one table.
#[derive(Debug, Clone, Default)]
pub struct Comparator {
    options: CompareOptions,
}

impl Comparator {
    pub fn new(options: CompareOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompareOptions {
        &self.options
    }

    /// Compare counts, then checksums when requested and counts agree (or
    /// always, with `checksum_even_if_counts_differ`).
    ///
    /// Source and target are read concurrently. Fails only on connectivity
    /// or query errors.
    pub async fn reconcile_table(
        &self,
        source: &mut Session,
        target: &mut Session,
        plan: &TablePlan,
    ) -> Result<ComparisonResult> {
        let span = info_span!("compare", table = %plan.name);
        self.compare(source, target, plan).instrument(span).await
    }

    async fn compare(&self, source: &mut Session, target: &mut Session, plan: &TablePlan) -> Result<ComparisonResult> {
        let started = Instant::now();
        let timestamp = Utc::now();

        let (source_count, target_count) = tokio::join!(
            get_row_count(source, &plan.source),
            get_row_count(target, &plan.target)
        );
        let (source_count, target_count) = (source_count?, target_count?);
        let count_match = compare_row_counts(source_count, target_count);
        if !count_match {
            info!(
                "{}: row count mismatch (source={}, target={})",
                plan.name, source_count, target_count
            );
        }

        let mut source_checksum = None;
        let mut target_checksum = None;
        let mut checksum_match = None;
        if self.options.validate_checksum && (count_match || self.options.checksum_even_if_counts_differ) {
            let chunk_size = self.options.chunk_size;
            let (s, t) = tokio::join!(
                checksum(source, &plan.source, chunk_size),
                checksum(target, &plan.target, chunk_size)
            );
            let (s, t) = (s?, t?);
            let matched = compare_checksums(&s, &t);
            if !matched {
                info!("{}: checksum mismatch ({} vs {})", plan.name, s, t);
            }
            checksum_match = Some(matched);
            source_checksum = Some(s);
            target_checksum = Some(t);
        }

        let result = ComparisonResult {
            table: plan.name.clone(),
            source_count,
            target_count,
            count_match,
            checksum_match,
            source_checksum,
            target_checksum,
            matched: count_match && checksum_match != Some(false),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp,
        };
        debug!(
            "{}: compared {} rows in {}ms (match={})",
            plan.name, result.source_count, result.duration_ms, result.matched
        );
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use rand::Rng;

    use crate::backend::memory::{MemoryDatabase, MemoryManager};
    use crate::core::{SoftDeleteStyle, SqlValue};
    use crate::dialect::DialectKind;
    use crate::pool::{Pool, PoolConfig};
    use crate::retry::RetryPolicy;

    pub(crate) fn session_for(db: &Arc<MemoryDatabase>, name: &str) -> Session {
        let manager = Arc::new(MemoryManager::new(db.clone()));
        let pool = Pool::new(name, manager, PoolConfig::new(4));
        let policy = RetryPolicy::new(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);
        Session::new(pool, policy, Duration::from_secs(5))
    }

    pub(crate) fn users_db(kind: DialectKind, schema: &str, rows: &[(i64, &str)]) -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new(kind));
        let table = TableRef::new(schema, "users");
        db.create_table(table.clone(), &["id", "name", "is_deleted"], &["id"])
            .unwrap();
        for (id, name) in rows {
            db.insert(
                &table,
                vec![
                    SqlValue::I64(*id),
                    SqlValue::Text(name.to_string()),
                    SqlValue::Bool(false),
                ],
            )
            .unwrap();
        }
        db
    }

    pub(crate) fn users_plan() -> TablePlan {
        let spec = TableSpec::new("dbo", "users", &["id"])
            .with_target("public", "users")
            .with_soft_delete("is_deleted", SoftDeleteStyle::Flag);
        TablePlan::new(&spec, "dbo", "public", vec!["name".to_string()], false)
    }

    #[tokio::test]
    async fn test_identical_tables_match() {
        let rows = [(1, "ann"), (2, "bob"), (3, "cy")];
        let source = users_db(DialectKind::Mssql, "dbo", &rows);
        let target = users_db(DialectKind::Postgres, "public", &rows);
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");

        let result = Comparator::default()
            .reconcile_table(&mut s, &mut t, &users_plan())
            .await
            .unwrap();
        assert!(result.count_match);
        assert_eq!(result.checksum_match, Some(true));
        assert!(result.matched);
        assert_eq!(result.source_count, 3);
        assert_eq!(result.table, "dbo.users");
    }

    #[tokio::test]
    async fn test_value_change_is_checksum_mismatch_not_error() {
        let source = users_db(DialectKind::Mssql, "dbo", &[(1, "ann"), (2, "bob")]);
        let target = users_db(DialectKind::Postgres, "public", &[(1, "ann"), (2, "bobby")]);
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");

        let result = Comparator::default()
            .reconcile_table(&mut s, &mut t, &users_plan())
            .await
            .unwrap();
        assert!(result.count_match);
        assert_eq!(result.checksum_match, Some(false));
        assert!(!result.matched);
    }

    #[tokio::test]
    async fn test_checksum_skipped_when_counts_differ() {
        let source = users_db(DialectKind::Mssql, "dbo", &[(1, "ann"), (2, "bob")]);
        let target = users_db(DialectKind::Postgres, "public", &[(1, "ann")]);
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");

        let result = Comparator::default()
            .reconcile_table(&mut s, &mut t, &users_plan())
            .await
            .unwrap();
        assert!(!result.count_match);
        assert_eq!(result.checksum_match, None);
        assert_eq!(result.row_count_delta(), 1);

        let always = Comparator::new(CompareOptions {
            checksum_even_if_counts_differ: true,
            ..CompareOptions::default()
        });
        let result = always.reconcile_table(&mut s, &mut t, &users_plan()).await.unwrap();
        assert_eq!(result.checksum_match, Some(false));
    }

    #[tokio::test]
    async fn test_tombstones_do_not_change_results() {
        let rows = [(1, "ann"), (2, "bob")];
        let source = users_db(DialectKind::Mssql, "dbo", &rows);
        let target = users_db(DialectKind::Postgres, "public", &rows);
        let plan = users_plan();
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");
        let before = calculate_checksum(&mut s, &plan.source).await.unwrap();

        source
            .insert(
                &TableRef::new("dbo", "users"),
                vec![SqlValue::I64(3), SqlValue::Text("gone".into()), SqlValue::Bool(true)],
            )
            .unwrap();

        assert_eq!(get_row_count(&mut s, &plan.source).await.unwrap(), 2);
        assert_eq!(calculate_checksum(&mut s, &plan.source).await.unwrap(), before);
        let result = Comparator::default().reconcile_table(&mut s, &mut t, &plan).await.unwrap();
        assert!(result.matched);

        // explicitly included tombstones are counted
        let spec = TableSpec::new("dbo", "users", &["id"])
            .with_target("public", "users")
            .with_soft_delete("is_deleted", SoftDeleteStyle::Flag);
        let with_deleted = TablePlan::new(&spec, "dbo", "public", vec!["name".into()], true);
        assert_eq!(get_row_count(&mut s, &with_deleted.source).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_chunked_equals_single_pass_for_any_chunk_size() {
        let rows: Vec<(i64, String)> = (1..=97).map(|i| (i * 3, format!("user{}", i % 11))).collect();
        let refs: Vec<(i64, &str)> = rows.iter().map(|(i, n)| (*i, n.as_str())).collect();
        let db = users_db(DialectKind::Postgres, "public", &refs);
        let mut session = session_for(&db, "target");
        let plan = users_plan();

        let whole = calculate_checksum(&mut session, &plan.target).await.unwrap();
        assert_eq!(whole.rows(), 97);

        let mut rng = rand::thread_rng();
        let mut sizes: Vec<usize> = vec![1, 2, 96, 97, 98, 500];
        sizes.extend((0..10).map(|_| rng.gen_range(1..=120)));
        for size in sizes {
            let chunked = calculate_checksum_chunked(&mut session, &plan.target, size)
                .await
                .unwrap();
            assert_eq!(chunked, whole, "chunk size {}", size);
        }
    }

    #[tokio::test]
    async fn test_chunked_respects_range_bounds() {
        let rows: Vec<(i64, &str)> = (1..=20).map(|i| (i, "x")).collect();
        let db = users_db(DialectKind::Postgres, "public", &rows);
        let mut session = session_for(&db, "target");
        let plan = users_plan().in_range(KeyRange::new(
            Some(RowKey::single(KeyValue::Int(5))),
            Some(RowKey::single(KeyValue::Int(15))),
        ));

        let whole = calculate_checksum(&mut session, &plan.target).await.unwrap();
        let chunked = calculate_checksum_chunked(&mut session, &plan.target, 4)
            .await
            .unwrap();
        assert_eq!(whole.rows(), 10);
        assert_eq!(chunked, whole);
    }

    #[tokio::test]
    async fn test_empty_table_checksums() {
        let db = users_db(DialectKind::Postgres, "public", &[]);
        let mut session = session_for(&db, "target");
        let plan = users_plan();
        let chunked = calculate_checksum_chunked(&mut session, &plan.target, 10)
            .await
            .unwrap();
        assert!(chunked.is_empty());
        assert_eq!(chunked, TableDigest::empty());
    }

    #[test]
    fn test_plan_resolves_both_sides() {
        let plan = users_plan();
        assert_eq!(plan.source.table, TableRef::new("dbo", "users"));
        assert_eq!(plan.target.table, TableRef::new("public", "users"));
        assert_eq!(plan.key_columns(), ["id".to_string()]);
        assert_eq!(plan.watermark.as_deref(), Some("id"));
        assert!(plan.source.soft_delete.is_some());
    }
}
