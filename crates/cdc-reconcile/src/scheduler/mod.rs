//! Parallel execution of reconciliation jobs.
//!
//! [`Scheduler::run`] spawns at most `max_workers` worker tasks. Each worker
//! owns one session per backend and pulls jobs from a shared queue until it
//! is empty or the run is cancelled. A failing, panicking or timed-out job
//! becomes a failed entry in the [`RunReport`]; other jobs keep running.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::manager_for;
use crate::config::{Config, EndpointConfig};
use crate::core::TableSpec;
use crate::error::{JobFailure, ReconcileError, Result};
use crate::incremental::IncrementalTracker;
use crate::observe::{CredentialProvider, TracingMetrics};
use crate::pool::{Pool, PoolConfig, PoolStats, Session};
use crate::reconciler::{ReconcileMode, ReconcileOptions, Reconciler, TableOutcome};
use crate::retry::RetryPolicy;

/// Upper bound on workers regardless of pool size.
const MAX_WORKERS: usize = 32;

/// One table to reconcile in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Position in the run; report entries are ordered by it.
    pub index: usize,
    pub spec: TableSpec,
    pub mode: ReconcileMode,
    pub options: ReconcileOptions,
}

impl Job {
    pub fn new(index: usize, spec: TableSpec, mode: ReconcileMode, options: ReconcileOptions) -> Self {
        Self {
            index,
            spec,
            mode,
            options,
        }
    }
}

/// One job per configured table, in configuration order.
pub fn jobs_from_config(config: &Config, force_resync: bool) -> Vec<Job> {
    let mut options = ReconcileOptions::from(&config.reconcile);
    options.force_resync = force_resync;
    config
        .tables
        .iter()
        .enumerate()
        .map(|(index, spec)| Job::new(index, spec.clone(), config.reconcile.mode, options.clone()))
        .collect()
}

/// Workers worth running for `table_count` tables on pools of `pool_capacity`.
pub fn estimate_optimal_workers(table_count: usize, pool_capacity: usize) -> usize {
    table_count.min(pool_capacity).min(MAX_WORKERS).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Matched,
    Mismatched,
    Failed,
    /// Never dispatched because the run was cancelled.
    Cancelled,
}

/// Fatal error of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryError {
    pub operation: String,
    pub message: String,
}

impl From<&JobFailure> for EntryError {
    fn from(failure: &JobFailure) -> Self {
        Self {
            operation: failure.operation.clone(),
            message: failure.cause.to_string(),
        }
    }
}

/// Report line for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunEntry {
    pub index: usize,
    pub table: String,
    pub status: EntryStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TableOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EntryError>,
}

impl RunEntry {
    fn finished(index: usize, table: String, duration: Duration, result: std::result::Result<TableOutcome, JobFailure>) -> Self {
        let duration_ms = duration.as_millis() as u64;
        match result {
            Ok(outcome) => {
                // a lost checkpoint write fails the table but keeps its result
                let (status, error) = match &outcome.checkpoint_error {
                    Some(message) => (
                        EntryStatus::Failed,
                        Some(EntryError {
                            operation: "save_checkpoint".into(),
                            message: message.clone(),
                        }),
                    ),
                    None if outcome.matched() => (EntryStatus::Matched, None),
                    None => (EntryStatus::Mismatched, None),
                };
                Self {
                    index,
                    table,
                    status,
                    duration_ms,
                    outcome: Some(outcome),
                    error,
                }
            }
            Err(failure) => Self {
                index,
                table,
                status: EntryStatus::Failed,
                duration_ms,
                outcome: None,
                error: Some(EntryError::from(&failure)),
            },
        }
    }

    fn cancelled(index: usize, table: String) -> Self {
        Self {
            index,
            table,
            status: EntryStatus::Cancelled,
            duration_ms: 0,
            outcome: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub tables: usize,
    pub matched: usize,
    pub mismatched: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub discrepancies: usize,
}

/// Aggregate result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    pub cancelled: bool,
    pub totals: RunTotals,
    /// One entry per job, ordered by job index.
    pub entries: Vec<RunEntry>,
}

impl RunReport {
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    /// Every job ran and matched.
    pub fn all_matched(&self) -> bool {
        self.totals.matched == self.totals.tables
    }

    pub fn failures(&self) -> impl Iterator<Item = &RunEntry> {
        self.entries.iter().filter(|e| e.status == EntryStatus::Failed)
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Reachability of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointHealth {
    pub backend: String,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stats: PoolStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub source: EndpointHealth,
    pub target: EndpointHealth,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.source.healthy && self.target.healthy
    }
}

async fn check_pool(pool: &Pool, timeout: Duration) -> EndpointHealth {
    let started = Instant::now();
    let result: Result<()> = async {
        let mut conn = pool.acquire(timeout).await?;
        conn.connection()?.ping().await
    }
    .await;
    EndpointHealth {
        backend: pool.name().to_string(),
        healthy: result.is_ok(),
        latency_ms: started.elapsed().as_millis() as u64,
        error: result.err().map(|e| e.to_string()),
        stats: pool.stats(),
    }
}

/// Runs jobs against a source and a target pool.
#[derive(Clone)]
pub struct Scheduler {
    source: Pool,
    target: Pool,
    reconciler: Reconciler,
    policy: RetryPolicy,
    query_timeout: Duration,
    job_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(source: Pool, target: Pool, reconciler: Reconciler) -> Self {
        Self {
            source,
            target,
            reconciler,
            policy: RetryPolicy::new(3),
            query_timeout: Duration::from_secs(300),
            job_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Build pools, retry policy and timeouts from `config`.
    ///
    /// No connection is opened here; pools connect on first use.
    pub async fn from_config(
        config: &Config,
        credentials: &dyn CredentialProvider,
        tracker: Option<Arc<IncrementalTracker>>,
    ) -> Result<Self> {
        let settings = &config.reconcile;
        let source = Self::pool_for("source", &config.source, config, credentials).await?;
        let target = Self::pool_for("target", &config.target, config, credentials).await?;

        let mut reconciler = Reconciler::new(config.source.schema.clone(), config.target.schema.clone())
            .with_metrics(Arc::new(TracingMetrics));
        if let Some(tracker) = tracker {
            reconciler = reconciler.with_tracker(tracker);
        }

        let job_timeout = match settings.job_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(Self::new(source, target, reconciler)
            .with_retry_policy(settings.retry.to_policy())
            .with_query_timeout(Duration::from_secs(settings.query_timeout_secs))
            .with_job_timeout(job_timeout))
    }

    async fn pool_for(
        name: &str,
        endpoint: &EndpointConfig,
        config: &Config,
        credentials: &dyn CredentialProvider,
    ) -> Result<Pool> {
        let manager = manager_for(endpoint, credentials.credentials(endpoint).await?)?;
        let pool_config = PoolConfig::new(config.reconcile.pool_size_for(endpoint))
            .with_acquire_timeout(Duration::from_secs(config.reconcile.acquire_timeout_secs))
            .with_connect_retry(config.reconcile.retry.to_policy());
        Ok(Pool::new(name, manager, pool_config))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Fail jobs running longer than `timeout`. `None` disables the limit.
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops dispatch of new jobs when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn source(&self) -> &Pool {
        &self.source
    }

    pub fn target(&self) -> &Pool {
        &self.target
    }

    /// Acquire and ping one connection on each backend.
    pub async fn health_check(&self) -> HealthReport {
        let (source, target) = tokio::join!(
            check_pool(&self.source, self.source.default_acquire_timeout()),
            check_pool(&self.target, self.target.default_acquire_timeout())
        );
        HealthReport { source, target }
    }

    /// Run `jobs` with at most `max_workers` in flight.
    ///
    /// Workers are capped at the smaller pool capacity: each worker holds
    /// one connection per backend for the length of a job.
    pub async fn run(&self, jobs: Vec<Job>, max_workers: usize) -> RunReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let total = jobs.len();

        let capacity = self.source.capacity().min(self.target.capacity());
        let mut workers = max_workers.max(1).min(total.max(1));
        if workers > capacity {
            warn!(
                "Requested {} workers but pool capacity is {}; using {}",
                workers, capacity, capacity
            );
            workers = capacity.max(1);
        }
        info!("Reconciling {} tables with {} workers", total, workers);

        let queue = Arc::new(Mutex::new(jobs.into_iter().collect::<VecDeque<_>>()));
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let this = self.clone();
            let queue = queue.clone();
            set.spawn(async move { this.worker(worker, queue).await });
        }

        let mut entries = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(done) => entries.extend(done),
                Err(e) => error!("Worker task ended abnormally: {}", e),
            }
        }

        // jobs left in the queue were never dispatched
        let remaining: Vec<Job> = queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for job in remaining {
            let table = self.reconciler.table_name(&job);
            entries.push(RunEntry::cancelled(job.index, table));
        }
        entries.sort_by_key(|e| e.index);

        let mut totals = RunTotals {
            tables: entries.len(),
            ..RunTotals::default()
        };
        for entry in &entries {
            match entry.status {
                EntryStatus::Matched => totals.matched += 1,
                EntryStatus::Mismatched => totals.mismatched += 1,
                EntryStatus::Failed => totals.failed += 1,
                EntryStatus::Cancelled => totals.cancelled += 1,
            }
            if let Some(outcome) = &entry.outcome {
                totals.discrepancies += outcome.discrepancies.len();
            }
        }

        let report = RunReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            completed_at: Utc::now(),
            duration_seconds: started.elapsed().as_secs_f64(),
            workers,
            config_hash: None,
            cancelled: self.cancel.is_cancelled(),
            totals,
            entries,
        };
        info!(
            "Run {} finished in {:.1}s: {} matched, {} mismatched, {} failed, {} cancelled",
            report.run_id,
            report.duration_seconds,
            report.totals.matched,
            report.totals.mismatched,
            report.totals.failed,
            report.totals.cancelled
        );
        report
    }

    fn next_job(&self, queue: &Mutex<VecDeque<Job>>) -> Option<Job> {
        if self.cancel.is_cancelled() {
            return None;
        }
        queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    async fn worker(self, worker: usize, queue: Arc<Mutex<VecDeque<Job>>>) -> Vec<RunEntry> {
        let mut source = Session::new(self.source.clone(), self.policy.clone(), self.query_timeout);
        let mut target = Session::new(self.target.clone(), self.policy.clone(), self.query_timeout);
        let mut entries = Vec::new();

        while let Some(job) = self.next_job(&queue) {
            let table = self.reconciler.table_name(&job);
            info!("{}: starting {} reconciliation (worker {})", table, job.mode, worker);
            let started = Instant::now();

            let result = self.run_job(&mut source, &mut target, &job, &table).await;
            let elapsed = started.elapsed();
            match &result {
                Ok(outcome) => info!(
                    "{}: {} in {:.1}s",
                    table,
                    if outcome.matched() { "matched" } else { "mismatched" },
                    elapsed.as_secs_f64()
                ),
                Err(failure) => error!("{}", failure),
            }
            entries.push(RunEntry::finished(job.index, table, elapsed, result));
        }
        entries
    }

    async fn run_job(
        &self,
        source: &mut Session,
        target: &mut Session,
        job: &Job,
        table: &str,
    ) -> std::result::Result<TableOutcome, JobFailure> {
        let work = AssertUnwindSafe(self.reconciler.reconcile(source, target, job)).catch_unwind();
        let result = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(done) => Some(done),
                Err(_) => None,
            },
            None => Some(work.await),
        };

        match result {
            Some(Ok(outcome)) => {
                source.release();
                target.release();
                outcome
            }
            Some(Err(panic)) => {
                source.discard();
                target.discard();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(JobFailure::new(
                    table,
                    "reconcile",
                    ReconcileError::Worker(format!("job panicked: {}", message)),
                ))
            }
            None => {
                // abandoned mid-query; do not hand these connections out again
                source.discard();
                target.discard();
                let limit = self.job_timeout.unwrap_or_default();
                Err(JobFailure::new(
                    table,
                    "reconcile",
                    ReconcileError::timeout(format!("{} reconciliation", table), limit),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::memory::{Fault, MemoryDatabase, MemoryManager};
    use crate::core::{SqlValue, TableRef};
    use crate::dialect::DialectKind;

    fn database(kind: DialectKind, schema: &str, tables: usize, skip: Option<usize>) -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new(kind));
        for i in 0..tables {
            if Some(i) == skip {
                continue;
            }
            let table = TableRef::new(schema, format!("t{}", i));
            db.create_table(table.clone(), &["id", "v"], &["id"]).unwrap();
            for id in 1..=5 {
                db.insert(&table, vec![SqlValue::I64(id), SqlValue::Text(format!("v{}", id))])
                    .unwrap();
            }
        }
        db
    }

    fn pool(db: &Arc<MemoryDatabase>, name: &str, size: usize) -> Pool {
        Pool::new(name, Arc::new(MemoryManager::new(db.clone())), PoolConfig::new(size))
    }

    fn jobs(n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| {
                Job::new(
                    i,
                    TableSpec::new("dbo", &format!("t{}", i), &["id"]).with_target("public", &format!("t{}", i)),
                    ReconcileMode::Full,
                    ReconcileOptions::default(),
                )
            })
            .collect()
    }

    fn scheduler(source: &Arc<MemoryDatabase>, target: &Arc<MemoryDatabase>, size: usize) -> Scheduler {
        Scheduler::new(
            pool(source, "source", size),
            pool(target, "target", size),
            Reconciler::new("dbo", "public"),
        )
        .with_retry_policy(RetryPolicy::new(2).with_base_delay(Duration::from_millis(1)).with_jitter(false))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_isolated_and_jobs_run_in_parallel() {
        let source = database(DialectKind::Mssql, "dbo", 10, None);
        // job #4 (index 3) has no target table
        let target = database(DialectKind::Postgres, "public", 10, Some(3));
        let latency = Duration::from_millis(100);
        source.set_latency(Some(latency));
        target.set_latency(Some(latency));

        let started = tokio::time::Instant::now();
        let report = scheduler(&source, &target, 3).run(jobs(10), 3).await;
        let elapsed = started.elapsed();

        assert_eq!(report.entries.len(), 10);
        assert_eq!(report.totals.matched, 9);
        assert_eq!(report.totals.failed, 1);
        let failed: Vec<_> = report.failures().map(|e| e.index).collect();
        assert_eq!(failed, vec![3]);
        assert_eq!(report.entries[3].table, "dbo.t3");
        assert!(report.entries[3]
            .error
            .as_ref()
            .unwrap()
            .message
            .contains("does not exist"));
        let indexes: Vec<_> = report.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, (0..10).collect::<Vec<_>>());

        // one job is three round trips; ceil(10/3) jobs deep, not ten
        let job = latency * 3;
        assert!(elapsed >= job * 3, "elapsed {:?}", elapsed);
        assert!(elapsed <= job * 4 + latency, "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_dispatch_but_finishes_in_flight() {
        let source = database(DialectKind::Mssql, "dbo", 3, None);
        let target = database(DialectKind::Postgres, "public", 3, None);
        source.set_latency(Some(Duration::from_millis(100)));
        target.set_latency(Some(Duration::from_millis(100)));

        let scheduler = scheduler(&source, &target, 2);
        let token = scheduler.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            token.cancel();
        });

        let report = scheduler.run(jobs(3), 1).await;
        assert!(report.cancelled);
        assert_eq!(report.entries[0].status, EntryStatus::Matched);
        assert_eq!(report.entries[1].status, EntryStatus::Cancelled);
        assert_eq!(report.entries[2].status, EntryStatus::Cancelled);
        assert_eq!(report.totals.cancelled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_fails_only_that_job() {
        let source = database(DialectKind::Mssql, "dbo", 2, None);
        let target = database(DialectKind::Postgres, "public", 2, None);
        source.set_latency(Some(Duration::from_millis(100)));

        let report = scheduler(&source, &target, 2)
            .with_job_timeout(Some(Duration::from_millis(50)))
            .run(jobs(2), 2)
            .await;
        assert_eq!(report.totals.failed, 2);
        let error = report.entries[0].error.as_ref().unwrap();
        assert!(error.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_panicking_job_becomes_failed_entry() {
        let source = database(DialectKind::Mssql, "dbo", 3, None);
        let target = database(DialectKind::Postgres, "public", 3, None);
        target.inject(Fault::Query, 1, || panic!("driver bug"));

        let report = scheduler(&source, &target, 1).run(jobs(3), 1).await;
        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.totals.failed, 1);
        assert_eq!(report.totals.matched, 2);
        let error = report.failures().next().unwrap().error.as_ref().unwrap();
        assert!(error.message.contains("driver bug"));
    }

    #[tokio::test]
    async fn test_workers_capped_by_pool_capacity() {
        let source = database(DialectKind::Mssql, "dbo", 6, None);
        let target = database(DialectKind::Postgres, "public", 6, None);
        let report = scheduler(&source, &target, 2).run(jobs(6), 8).await;
        assert_eq!(report.workers, 2);
        assert!(report.all_matched());
        assert!(report.to_json().unwrap().contains("\"matched\""));
    }

    #[tokio::test]
    async fn test_health_check_reports_failing_backend() {
        let source = database(DialectKind::Mssql, "dbo", 0, None);
        let target = database(DialectKind::Postgres, "public", 0, None);
        target.inject(Fault::Connect, usize::MAX, || {
            ReconcileError::connectivity("memory", "connection refused")
        });

        let report = Scheduler::new(
            pool(&source, "source", 1),
            Pool::new(
                "target",
                Arc::new(MemoryManager::new(target.clone())),
                PoolConfig::new(1)
                    .with_acquire_timeout(Duration::from_millis(100))
                    .with_connect_retry(RetryPolicy::no_retry()),
            ),
            Reconciler::new("dbo", "public"),
        )
        .health_check()
        .await;
        assert!(report.source.healthy);
        assert!(!report.target.healthy);
        assert!(!report.healthy());
        assert!(report.target.error.as_deref().unwrap().contains("connection refused"));
    }

    #[test]
    fn test_estimate_optimal_workers() {
        assert_eq!(estimate_optimal_workers(10, 4), 4);
        assert_eq!(estimate_optimal_workers(2, 16), 2);
        assert_eq!(estimate_optimal_workers(0, 8), 1);
        assert_eq!(estimate_optimal_workers(100, 100), 32);
    }

    #[test]
    fn test_jobs_from_config_keep_order() {
        let config = Config::from_yaml(
            "source: {type: mssql, host: a, database: d, user: u}\n\
             target: {type: postgres, host: b, database: d, user: u}\n\
             tables:\n  - {name: x, primary_key: [id]}\n  - {name: y, primary_key: [id]}\n\
             reconcile: {chunk_size: 500}\n",
        )
        .unwrap();
        let jobs = jobs_from_config(&config, true);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].index, 1);
        assert_eq!(jobs[1].spec.name, "y");
        assert!(jobs[0].options.force_resync);
        assert_eq!(jobs[0].options.compare.chunk_size, Some(500));
    }

    #[tokio::test]
    async fn test_from_config_sizes_pools_without_connecting() {
        let config = Config::from_yaml(
            "source: {type: mssql, host: a, database: d, user: u}\n\
             target: {type: postgres, host: b, database: d, user: u}\n\
             tables:\n  - {name: x, primary_key: [id]}\n\
             reconcile: {workers: 3, job_timeout_secs: 0, query_timeout_secs: 9}\n",
        )
        .unwrap();
        let scheduler = Scheduler::from_config(&config, &crate::observe::ConfigCredentials, None)
            .await
            .unwrap();
        assert_eq!(scheduler.source().capacity(), 5);
        assert_eq!(scheduler.source().kind(), DialectKind::Mssql);
        assert_eq!(scheduler.target().kind(), DialectKind::Postgres);
        assert_eq!(scheduler.target().size(), 0);
        assert_eq!(scheduler.job_timeout, None);
        assert_eq!(scheduler.query_timeout, Duration::from_secs(9));
    }
}
