//! Single-table unit of work.
//!
//! A [`Reconciler`] turns one [`Job`] into a [`TableOutcome`]: it resolves
//! the compared columns, runs the count/checksum comparison (over the whole
//! table or over an incremental window), advances the checkpoint on a
//! match, and localizes divergent keys on a mismatch.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compare::{self, CompareOptions, Comparator, ComparisonResult, TablePlan};
use crate::config::ReconcileConfig;
use crate::core::KeyValue;
use crate::error::{JobContext, JobFailure, ReconcileError};
use crate::incremental::{Checkpoint, IncrementalTracker};
use crate::observe::{metric, MetricsSink, NoopMetrics};
use crate::pool::Session;
use crate::rowlevel::{generate_repair_script, Discrepancy, RepairScript, RowLevelReconciler};
use crate::scheduler::Job;

/// How a table is compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Whole table on every run.
    #[default]
    Full,
    /// Only rows above the stored watermark.
    Incremental,
}

impl ReconcileMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileMode::Full => "full",
            ReconcileMode::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub compare: CompareOptions,
    /// Localize divergent keys when a comparison does not match.
    pub row_level: bool,
    pub leaf_size: usize,
    pub max_discrepancies: usize,
    pub include_soft_deleted: bool,
    /// Ignore the stored checkpoint and rebuild it from scratch.
    pub force_resync: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            compare: CompareOptions::default(),
            row_level: true,
            leaf_size: 1000,
            max_discrepancies: 10_000,
            include_soft_deleted: false,
            force_resync: false,
        }
    }
}

impl From<&ReconcileConfig> for ReconcileOptions {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            compare: CompareOptions {
                validate_checksum: config.validate_checksum,
                checksum_even_if_counts_differ: config.checksum_even_if_counts_differ,
                chunk_size: Some(config.get_chunk_size()),
            },
            row_level: config.row_level,
            leaf_size: config.leaf_size,
            max_discrepancies: config.max_discrepancies,
            include_soft_deleted: config.include_soft_deleted,
            force_resync: false,
        }
    }
}

/// Incremental bookkeeping of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncrementalInfo {
    /// Exclusive lower bound of the compared window.
    pub after: Option<KeyValue>,
    /// Inclusive upper bound (source high mark at run start).
    pub up_to: Option<KeyValue>,
    pub resync: bool,
    /// Checkpoint stored by this run, if it advanced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

/// Result of reconciling one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub mode: ReconcileMode,
    /// Counts are window counts in incremental mode.
    pub comparison: ComparisonResult,
    pub discrepancies: Vec<Discrepancy>,
    /// Localization stopped at the discrepancy limit.
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalInfo>,
    /// Set when the comparison finished but the checkpoint could not be saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_error: Option<String>,
    #[serde(skip)]
    pub repair: Option<RepairScript>,
}

impl TableOutcome {
    pub fn matched(&self) -> bool {
        self.comparison.matched
    }
}

/// Composes comparison, incremental tracking and localization for one table.
#[derive(Clone)]
pub struct Reconciler {
    source_schema: String,
    target_schema: String,
    tracker: Option<Arc<IncrementalTracker>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Reconciler {
    /// `source_schema`/`target_schema` apply to tables that do not name one.
    pub fn new(source_schema: impl Into<String>, target_schema: impl Into<String>) -> Self {
        Self {
            source_schema: source_schema.into(),
            target_schema: target_schema.into(),
            tracker: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<IncrementalTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn tracker(&self) -> Option<&Arc<IncrementalTracker>> {
        self.tracker.as_ref()
    }

    /// Identity of `job`'s table in logs, reports and checkpoints.
    pub fn table_name(&self, job: &Job) -> String {
        job.spec.source_ref(&self.source_schema).to_string()
    }

    /// Reconcile one table.
    ///
    /// Data mismatches are part of the outcome. Errors carry the table and
    /// the failing operation.
    pub async fn reconcile(
        &self,
        source: &mut Session,
        target: &mut Session,
        job: &Job,
    ) -> std::result::Result<TableOutcome, JobFailure> {
        let table = self.table_name(job);
        let started = Instant::now();
        self.metrics.increment(metric::RUNS_TOTAL, &table, 1);

        let result = self.run(source, target, job, &table).await;
        let secs = started.elapsed().as_secs_f64();
        match &result {
            Ok(outcome) => {
                let c = &outcome.comparison;
                self.metrics
                    .gauge(metric::ROW_COUNT_DELTA, &table, c.row_count_delta() as f64);
                self.metrics.observe(metric::DURATION_SECONDS, &table, secs);
                if secs > 0.0 {
                    self.metrics
                        .observe(metric::ROWS_PER_SECOND, &table, c.source_count as f64 / secs);
                }
                if !outcome.discrepancies.is_empty() {
                    self.metrics.increment(
                        metric::MISMATCHES_TOTAL,
                        &table,
                        outcome.discrepancies.len() as u64,
                    );
                }
                if outcome.checkpoint_error.is_some() {
                    self.metrics.increment(metric::FAILURES_TOTAL, &table, 1);
                }
            }
            Err(_) => self.metrics.increment(metric::FAILURES_TOTAL, &table, 1),
        }
        result
    }

    async fn run(
        &self,
        source: &mut Session,
        target: &mut Session,
        job: &Job,
        table: &str,
    ) -> std::result::Result<TableOutcome, JobFailure> {
        let spec = &job.spec;
        let options = &job.options;

        // key column types are needed even when value columns are configured
        let catalog = compare::list_columns(source, &spec.source_ref(&self.source_schema))
            .await
            .in_job(table, "list_columns")?;
        let discovered: Vec<String> = catalog.iter().map(|c| c.name.clone()).collect();
        let value_columns = spec.value_columns(&discovered);
        debug!("{}: comparing {} value columns", table, value_columns.len());
        let plan = TablePlan::new(
            spec,
            &self.source_schema,
            &self.target_schema,
            value_columns,
            options.include_soft_deleted,
        )
        .with_key_kinds(spec.key_kinds(&catalog));

        let mut outcome = match job.mode {
            ReconcileMode::Full => {
                let comparison = Comparator::new(options.compare.clone())
                    .reconcile_table(source, target, &plan)
                    .await
                    .in_job(table, "compare")?;
                TableOutcome {
                    table: table.to_string(),
                    mode: job.mode,
                    comparison,
                    discrepancies: Vec::new(),
                    truncated: false,
                    incremental: None,
                    checkpoint_error: None,
                    repair: None,
                }
            }
            ReconcileMode::Incremental => {
                let (outcome, windowed) = self.run_incremental(source, target, job, &plan, table).await?;
                return self.localize(source, target, options, &windowed, outcome).await;
            }
        };

        if outcome.comparison.matched {
            info!("{}: source and target match ({} rows)", table, outcome.comparison.source_count);
            return Ok(outcome);
        }
        outcome = self.localize(source, target, options, &plan, outcome).await?;
        Ok(outcome)
    }

    /// Compare the window above the checkpoint and advance the checkpoint
    /// on a match. Returns the outcome and the windowed plan.
    async fn run_incremental(
        &self,
        source: &mut Session,
        target: &mut Session,
        job: &Job,
        plan: &TablePlan,
        table: &str,
    ) -> std::result::Result<(TableOutcome, TablePlan), JobFailure> {
        let options = &job.options;
        let tracker = self.tracker.as_ref().ok_or_else(|| {
            JobFailure::new(
                table,
                "load_checkpoint",
                ReconcileError::Config("incremental mode needs a checkpoint store".into()),
            )
        })?;
        let column = plan.watermark.clone().ok_or_else(|| {
            JobFailure::new(
                table,
                "load_checkpoint",
                ReconcileError::Config(format!("{}: no watermark column", table)),
            )
        })?;

        // held until the checkpoint is saved or abandoned
        let lock = tracker.lock(table).await;
        let resync = options.force_resync;
        let checkpoint = if resync {
            info!("{}: full resync, ignoring stored checkpoint", table);
            None
        } else {
            tracker.load_checkpoint(table).await.in_job(table, "load_checkpoint")?
        };

        let high = IncrementalTracker::high_mark(source, &plan.source, &column)
            .await
            .in_job(table, "high_mark")?;
        let window = IncrementalTracker::delta_window(&column, checkpoint.as_ref(), high.clone());
        let windowed = plan.windowed(Some(window.clone()));
        info!(
            "{}: comparing window {} > {} and <= {}",
            table,
            column,
            window.after.as_ref().map_or_else(|| "-inf".to_string(), |v| v.to_string()),
            window.up_to.as_ref().map_or_else(|| "+inf".to_string(), |v| v.to_string())
        );

        // the delta digest feeds the checkpoint, so it is always computed
        let compare_options = CompareOptions {
            validate_checksum: true,
            ..options.compare.clone()
        };
        let comparison = Comparator::new(compare_options)
            .reconcile_table(source, target, &windowed)
            .await
            .in_job(table, "compare")?;

        let mut saved = None;
        let mut checkpoint_error = None;
        match (&comparison.source_checksum, comparison.matched) {
            (Some(delta), true) => {
                let previous = checkpoint.as_ref();
                let base = previous.map(|cp| cp.checksum).unwrap_or_default();
                let watermark = previous.and_then(|cp| cp.watermark.clone()).max(high.clone());
                match tracker
                    .save_checkpoint(&lock, watermark, base.combined(delta), resync)
                    .await
                {
                    Ok(cp) => saved = Some(cp),
                    Err(e) => {
                        let failure = JobFailure::new(table, "save_checkpoint", e);
                        warn!("{}", failure);
                        checkpoint_error = Some(failure.to_string());
                    }
                }
            }
            _ => info!("{}: window does not match, checkpoint not advanced", table),
        }
        drop(lock);

        let outcome = TableOutcome {
            table: table.to_string(),
            mode: job.mode,
            comparison,
            discrepancies: Vec::new(),
            truncated: false,
            incremental: Some(IncrementalInfo {
                after: window.after,
                up_to: window.up_to,
                resync,
                checkpoint: saved,
            }),
            checkpoint_error,
            repair: None,
        };
        Ok((outcome, windowed))
    }

    /// Record count and key discrepancies of a mismatched outcome and build
    /// its repair script.
    async fn localize(
        &self,
        source: &mut Session,
        target: &mut Session,
        options: &ReconcileOptions,
        plan: &TablePlan,
        mut outcome: TableOutcome,
    ) -> std::result::Result<TableOutcome, JobFailure> {
        if outcome.comparison.matched {
            return Ok(outcome);
        }
        let table = outcome.table.clone();
        if !outcome.comparison.count_match {
            outcome
                .discrepancies
                .push(Discrepancy::count_mismatch(&outcome.comparison));
        }
        if !options.row_level {
            return Ok(outcome);
        }

        let localization = RowLevelReconciler::new(options.leaf_size, options.max_discrepancies)
            .localize(source, target, plan, true)
            .await
            .in_job(&table, "localize")?;
        outcome.truncated = localization.truncated;
        outcome.discrepancies.extend(localization.discrepancies);

        let script = generate_repair_script(plan, target.pool().kind(), &outcome.discrepancies)
            .in_job(&table, "repair_script")?;
        if !script.is_empty() {
            info!("{}: {} repair statements", table, script.len());
            outcome.repair = Some(script);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::memory::{Fault, MemoryDatabase};
    use crate::compare::tests::{session_for, users_db};
    use crate::core::{SoftDeleteStyle, SqlValue, TableRef, TableSpec};
    use crate::dialect::DialectKind;
    use crate::incremental::{CheckpointStore, MemoryCheckpointStore};
    use crate::observe::RecordingMetrics;
    use crate::rowlevel::DiscrepancyKind;

    fn spec() -> TableSpec {
        TableSpec::new("dbo", "users", &["id"])
            .with_target("public", "users")
            .with_soft_delete("is_deleted", SoftDeleteStyle::Flag)
    }

    fn job(mode: ReconcileMode) -> Job {
        Job::new(0, spec(), mode, ReconcileOptions::default())
    }

    fn add_user(db: &MemoryDatabase, schema: &str, id: i64, name: &str) {
        db.insert(
            &TableRef::new(schema, "users"),
            vec![SqlValue::I64(id), SqlValue::Text(name.into()), SqlValue::Bool(false)],
        )
        .unwrap();
    }

    fn incremental_reconciler() -> (Reconciler, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let tracker = Arc::new(IncrementalTracker::new(store.clone()));
        (Reconciler::new("dbo", "public").with_tracker(tracker), store)
    }

    #[tokio::test]
    async fn test_full_mode_discovers_columns_and_repairs() {
        let source = users_db(DialectKind::Mssql, "dbo", &[(1, "a"), (2, "b")]);
        let target = users_db(DialectKind::Postgres, "public", &[(1, "a"), (3, "b")]);
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");
        let metrics = Arc::new(RecordingMetrics::default());
        let reconciler = Reconciler::new("dbo", "public").with_metrics(metrics.clone());

        let outcome = reconciler
            .reconcile(&mut s, &mut t, &job(ReconcileMode::Full))
            .await
            .unwrap();
        assert!(!outcome.matched());
        assert_eq!(outcome.comparison.checksum_match, Some(false));
        let kinds: Vec<_> = outcome.discrepancies.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![DiscrepancyKind::MissingInTarget, DiscrepancyKind::MissingInSource]
        );

        let repair = outcome.repair.unwrap();
        assert_eq!(repair.len(), 2);
        assert!(repair.statements[0].sql.starts_with("UPDATE \"public\".\"users\" SET \"is_deleted\""));
        assert!(repair.statements[1].sql.contains("\"is_deleted\""));

        assert_eq!(metrics.total(metric::RUNS_TOTAL), 1.0);
        assert_eq!(metrics.total(metric::MISMATCHES_TOTAL), 2.0);
        assert_eq!(metrics.total(metric::FAILURES_TOTAL), 0.0);
    }

    #[tokio::test]
    async fn test_count_mismatch_is_recorded() {
        let source = users_db(DialectKind::Mssql, "dbo", &[(1, "a"), (2, "b"), (3, "c")]);
        let target = users_db(DialectKind::Postgres, "public", &[(1, "a")]);
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");

        let outcome = Reconciler::new("dbo", "public")
            .reconcile(&mut s, &mut t, &job(ReconcileMode::Full))
            .await
            .unwrap();
        assert_eq!(outcome.discrepancies[0].kind, DiscrepancyKind::CountMismatch);
        assert_eq!(outcome.discrepancies.len(), 3);
    }

    #[tokio::test]
    async fn test_incremental_detects_exactly_new_rows() {
        let rows: Vec<(i64, &str)> = (1..=20).map(|i| (i, "x")).collect();
        let source = users_db(DialectKind::Mssql, "dbo", &rows);
        let target = users_db(DialectKind::Postgres, "public", &rows);
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");
        let (reconciler, _store) = incremental_reconciler();
        let job = job(ReconcileMode::Incremental);

        let first = reconciler.reconcile(&mut s, &mut t, &job).await.unwrap();
        assert!(first.matched());
        let cp = first.incremental.unwrap().checkpoint.unwrap();
        assert_eq!(cp.watermark, Some(KeyValue::Int(20)));

        // N new rows above the watermark, replicated to only part of them
        for id in 21..=25 {
            add_user(&source, "dbo", id, "new");
        }
        add_user(&target, "public", 21, "new");

        let second = reconciler.reconcile(&mut s, &mut t, &job).await.unwrap();
        assert_eq!(second.comparison.source_count, 5);
        assert_eq!(second.comparison.target_count, 1);
        let missing: Vec<_> = second
            .discrepancies
            .iter()
            .filter(|d| d.kind == DiscrepancyKind::MissingInTarget)
            .filter_map(|d| d.key.clone())
            .collect();
        assert_eq!(missing.len(), 4);
        let info = second.incremental.unwrap();
        assert!(info.checkpoint.is_none());
        assert_eq!(info.after, Some(KeyValue::Int(20)));

        let stored = reconciler
            .tracker()
            .unwrap()
            .load_checkpoint("dbo.users")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.watermark, Some(KeyValue::Int(20)));
    }

    #[tokio::test]
    async fn test_cumulative_checkpoint_equals_resync_and_full_checksum() {
        let source = users_db(DialectKind::Mssql, "dbo", &[]);
        let target = users_db(DialectKind::Postgres, "public", &[]);
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");
        let (reconciler, store) = incremental_reconciler();
        let job = job(ReconcileMode::Incremental);

        let mut next = 1;
        for batch in [7, 0, 13, 4] {
            for _ in 0..batch {
                add_user(&source, "dbo", next, &format!("u{}", next));
                add_user(&target, "public", next, &format!("u{}", next));
                next += 1;
            }
            let outcome = reconciler.reconcile(&mut s, &mut t, &job).await.unwrap();
            assert!(outcome.matched());
            assert!(outcome.checkpoint_error.is_none());
        }
        let cumulative = store.load("dbo.users").await.unwrap().unwrap();
        assert_eq!(cumulative.checksum.rows(), 24);

        let mut resync = job.clone();
        resync.options.force_resync = true;
        let outcome = reconciler.reconcile(&mut s, &mut t, &resync).await.unwrap();
        let rebuilt = outcome.incremental.unwrap().checkpoint.unwrap();
        assert_eq!(rebuilt.checksum, cumulative.checksum);
        assert_eq!(rebuilt.watermark, cumulative.watermark);

        let full = Reconciler::new("dbo", "public")
            .reconcile(&mut s, &mut t, &job_with_mode(&job, ReconcileMode::Full))
            .await
            .unwrap();
        assert_eq!(full.comparison.source_checksum, Some(cumulative.checksum));
    }

    fn job_with_mode(job: &Job, mode: ReconcileMode) -> Job {
        Job::new(job.index, job.spec.clone(), mode, job.options.clone())
    }

    #[tokio::test]
    async fn test_checkpoint_write_failure_keeps_result_and_old_checkpoint() {
        let rows: Vec<(i64, &str)> = (1..=5).map(|i| (i, "x")).collect();
        let source = users_db(DialectKind::Mssql, "dbo", &rows);
        let target = users_db(DialectKind::Postgres, "public", &rows);
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");
        let (reconciler, store) = incremental_reconciler();
        let job = job(ReconcileMode::Incremental);
        reconciler.reconcile(&mut s, &mut t, &job).await.unwrap();

        add_user(&source, "dbo", 6, "y");
        add_user(&target, "public", 6, "y");
        store.fail_next_saves(1);
        let outcome = reconciler.reconcile(&mut s, &mut t, &job).await.unwrap();
        assert!(outcome.matched());
        assert_eq!(outcome.comparison.source_count, 1);
        assert!(outcome
            .checkpoint_error
            .as_deref()
            .unwrap()
            .contains("save_checkpoint"));
        assert_eq!(
            store.load("dbo.users").await.unwrap().unwrap().watermark,
            Some(KeyValue::Int(5))
        );

        // next run reprocesses the same window
        let retry = reconciler.reconcile(&mut s, &mut t, &job).await.unwrap();
        let info = retry.incremental.unwrap();
        assert_eq!(info.after, Some(KeyValue::Int(5)));
        assert_eq!(info.checkpoint.unwrap().watermark, Some(KeyValue::Int(6)));
    }

    #[tokio::test]
    async fn test_incremental_without_store_fails_with_context() {
        let source = users_db(DialectKind::Mssql, "dbo", &[(1, "a")]);
        let target = users_db(DialectKind::Postgres, "public", &[(1, "a")]);
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");

        let err = Reconciler::new("dbo", "public")
            .reconcile(&mut s, &mut t, &job(ReconcileMode::Incremental))
            .await
            .unwrap_err();
        assert_eq!(err.table, "dbo.users");
        assert_eq!(err.operation, "load_checkpoint");
    }

    #[tokio::test]
    async fn test_query_failure_names_table_and_operation() {
        let source = users_db(DialectKind::Mssql, "dbo", &[(1, "a")]);
        let target = Arc::new(MemoryDatabase::new(DialectKind::Postgres));
        target.inject(Fault::Query, usize::MAX, || {
            ReconcileError::query("memory", "permission denied")
        });
        let mut s = session_for(&source, "source");
        let mut t = session_for(&target, "target");
        let metrics = Arc::new(RecordingMetrics::default());

        let err = Reconciler::new("dbo", "public")
            .with_metrics(metrics.clone())
            .reconcile(&mut s, &mut t, &job(ReconcileMode::Full))
            .await
            .unwrap_err();
        assert_eq!(err.operation, "compare");
        assert!(err.to_string().contains("permission denied"));
        assert_eq!(metrics.total(metric::FAILURES_TOTAL), 1.0);
    }
}
