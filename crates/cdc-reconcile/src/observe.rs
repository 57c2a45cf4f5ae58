//! Seams to the collaborators around the engine.
//!
//! The engine asks a [`CredentialProvider`] for login secrets, emits metric
//! events through a [`MetricsSink`], and hands finished reports and repair
//! scripts to a [`ReportSink`] and a [`RepairSink`]. Each comes with a small
//! default implementation; richer ones (a secrets manager, a Prometheus
//! exporter, CSV output) plug in behind the same traits.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::error::{ReconcileError, Result};
use crate::rowlevel::RepairScript;
use crate::scheduler::RunReport;

/// Login secrets for one endpoint.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Supplies credentials for an endpoint.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, endpoint: &EndpointConfig) -> Result<Credentials>;
}

/// Credentials taken from the configuration file or the environment
/// variable it names.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigCredentials;

#[async_trait]
impl CredentialProvider for ConfigCredentials {
    async fn credentials(&self, endpoint: &EndpointConfig) -> Result<Credentials> {
        let password = match (&endpoint.password, &endpoint.password_env) {
            (Some(password), _) => password.clone(),
            (None, Some(var)) => std::env::var(var).map_err(|_| {
                ReconcileError::Config(format!(
                    "{}: environment variable {} is not set",
                    endpoint.location(),
                    var
                ))
            })?,
            (None, None) => String::new(),
        };
        Ok(Credentials {
            user: endpoint.user.clone(),
            password,
        })
    }
}

/// Metric names emitted by the engine.
pub mod metric {
    /// Counter: jobs started.
    pub const RUNS_TOTAL: &str = "runs_total";
    /// Counter: jobs that ended in a fatal error.
    pub const FAILURES_TOTAL: &str = "failures_total";
    /// Counter: discrepancies found.
    pub const MISMATCHES_TOTAL: &str = "mismatches_total";
    /// Gauge: source count minus target count.
    pub const ROW_COUNT_DELTA: &str = "row_count_delta";
    /// Histogram: job duration in seconds.
    pub const DURATION_SECONDS: &str = "duration_seconds";
    /// Histogram: rows compared per second.
    pub const ROWS_PER_SECOND: &str = "rows_per_second";
}

/// Kind of a metric event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// One emitted metric value, labelled with its table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub name: &'static str,
    pub kind: MetricKind,
    pub table: String,
    pub value: f64,
}

/// Receives metric events from jobs.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);

    fn increment(&self, name: &'static str, table: &str, by: u64) {
        self.record(MetricEvent {
            name,
            kind: MetricKind::Counter,
            table: table.to_string(),
            value: by as f64,
        });
    }

    fn gauge(&self, name: &'static str, table: &str, value: f64) {
        self.record(MetricEvent {
            name,
            kind: MetricKind::Gauge,
            table: table.to_string(),
            value,
        });
    }

    fn observe(&self, name: &'static str, table: &str, value: f64) {
        self.record(MetricEvent {
            name,
            kind: MetricKind::Histogram,
            table: table.to_string(),
            value,
        });
    }
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

/// Logs events at debug level under the `metrics` target.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, event: MetricEvent) {
        debug!(
            target: "metrics",
            name = event.name,
            kind = ?event.kind,
            table = %event.table,
            value = event.value,
            "metric"
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sum of all values recorded under `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.events()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.value)
            .sum()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, event: MetricEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Receives the aggregate report of a run.
pub trait ReportSink: Send + Sync {
    fn publish(&self, report: &RunReport) -> Result<()>;
}

/// Writes the report as pretty JSON to a file.
#[derive(Debug, Clone)]
pub struct JsonFileReport {
    path: PathBuf,
}

impl JsonFileReport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReportSink for JsonFileReport {
    fn publish(&self, report: &RunReport) -> Result<()> {
        std::fs::write(&self.path, report.to_json()?)?;
        info!("Report written to {}", self.path.display());
        Ok(())
    }
}

/// Receives generated repair scripts.
pub trait RepairSink: Send + Sync {
    fn accept(&self, script: &RepairScript) -> Result<()>;
}

/// Writes one `<schema>.<table>.sql` file per script into a directory.
#[derive(Debug, Clone)]
pub struct DirectoryRepairSink {
    dir: PathBuf,
}

impl DirectoryRepairSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a script for `table` is written to.
    pub fn path_for(&self, table: &str) -> PathBuf {
        let name: String = table
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.sql", name))
    }
}

impl RepairSink for DirectoryRepairSink {
    fn accept(&self, script: &RepairScript) -> Result<()> {
        if script.is_empty() {
            return Ok(());
        }
        let path = self.path_for(&script.table);
        std::fs::write(&path, script.render())?;
        info!(
            "{}: repair script with {} statements written to {}",
            script.table,
            script.len(),
            path.display()
        );
        Ok(())
    }
}
