//! Config file types and the host-sized defaults for unset knobs.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::backend::tls::SslMode;
use crate::core::TableSpec;
use crate::dialect::DialectKind;
use crate::reconciler::ReconcileMode;
use crate::retry::RetryConfig;

/// Host capacity used to size workers and chunks.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Read memory and core count once.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len().max(1),
        }
    }

    pub fn log(&self) {
        info!(
            "Host has {:.1} GB RAM and {} cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Everything a reconciliation run reads from `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Replication source.
    pub source: EndpointConfig,

    /// Replication target.
    pub target: EndpointConfig,

    /// Tables to reconcile.
    #[serde(default)]
    pub tables: Vec<TableSpec>,

    /// Reconciliation behavior.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Where incremental checkpoints live.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Config {
    /// Fill unset worker and chunk knobs from the host. Values given in the
    /// file are kept.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.reconcile = self.reconcile.with_auto_tuning(&resources);
        self
    }
}

/// Connection settings of one database.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Backend family: `mssql` or `postgres`.
    pub r#type: DialectKind,

    /// Database host.
    pub host: String,

    /// Port (default: 1433 for mssql, 5432 for postgres).
    #[serde(default)]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password. Prefer `password_env`.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Environment variable holding the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Default schema for tables without one (default: dbo / public).
    #[serde(default)]
    pub schema: String,

    /// SQL Server: encrypt the connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// SQL Server: accept any server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// PostgreSQL: sslmode (default: disable).
    #[serde(default)]
    pub ssl_mode: SslMode,

    /// TCP connect timeout in seconds (default: 15).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Pool size. Auto-tuned from workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("password_env", &self.password_env)
            .field("schema", &self.schema)
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl EndpointConfig {
    /// Fill type-dependent defaults left empty in the file.
    pub fn apply_defaults(&mut self) {
        if self.port == 0 {
            self.port = match self.r#type {
                DialectKind::Mssql => 1433,
                DialectKind::Postgres => 5432,
            };
        }
        if self.schema.is_empty() {
            self.schema = match self.r#type {
                DialectKind::Mssql => "dbo".to_string(),
                DialectKind::Postgres => "public".to_string(),
            };
        }
    }

    /// `host:port/database`, for logs and reports.
    pub fn location(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Reconciliation behavior configuration.
/// Sizing fields are `Option` so that an unset value, which
/// `with_auto_tuning` fills, stays distinct from one given in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Default mode for `run` (default: full).
    #[serde(default)]
    pub mode: ReconcileMode,

    /// Concurrent table jobs. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Rows per checksum chunk. Auto-tuned based on RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    /// Compare checksums after counts (default: true).
    #[serde(default = "default_true")]
    pub validate_checksum: bool,

    /// Compare checksums even when counts differ (default: false).
    #[serde(default)]
    pub checksum_even_if_counts_differ: bool,

    /// Localize checksum mismatches to keys (default: true).
    #[serde(default = "default_true")]
    pub row_level: bool,

    /// Largest key range enumerated row by row during localization (default: 1000).
    #[serde(default = "default_leaf_size")]
    pub leaf_size: usize,

    /// Stop localizing after this many discrepancies per table (default: 10000).
    #[serde(default = "default_max_discrepancies")]
    pub max_discrepancies: usize,

    /// Count soft-deleted rows as live (default: false).
    #[serde(default)]
    pub include_soft_deleted: bool,

    /// Per-table job deadline in seconds (default: 3600, 0 disables).
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Per-query deadline in seconds (default: 300).
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Pool acquisition timeout in seconds (default: 30).
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Retry policy for queries and reconnects.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            mode: ReconcileMode::default(),
            workers: None,
            chunk_size: None,
            validate_checksum: true,
            checksum_even_if_counts_differ: false,
            row_level: true,
            leaf_size: default_leaf_size(),
            max_discrepancies: default_max_discrepancies(),
            include_soft_deleted: false,
            job_timeout_secs: default_job_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl ReconcileConfig {
    /// Size `workers` and `chunk_size` for this host when they are `None`.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;

        // leave two cores for the drivers, within [2, 32]
        if self.workers.is_none() {
            self.workers = Some(cores.saturating_sub(2).clamp(2, 32));
        }

        // Chunk size: 50K rows, +25K per 8GB of RAM, cap at 200K
        if self.chunk_size.is_none() {
            let chunk = 50_000 + ((resources.total_memory_gb / 8.0) as usize * 25_000);
            self.chunk_size = Some(chunk.clamp(50_000, 200_000));
        }

        info!(
            "Auto-tuned config: workers={}, chunk_size={}",
            self.get_workers(),
            self.get_chunk_size()
        );

        self
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(50_000)
    }

    /// Pool size for an endpoint: explicit, or workers + 2 clamped to 4..=64.
    ///
    /// Each worker holds one connection per side for the whole job.
    pub fn pool_size_for(&self, endpoint: &EndpointConfig) -> usize {
        endpoint
            .max_connections
            .unwrap_or_else(|| (self.get_workers() + 2).clamp(4, 64))
    }
}

/// Checkpoint store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStoreKind {
    /// One HMAC-signed JSON file per table.
    #[default]
    File,
    /// A table in a PostgreSQL database.
    Postgres,
    /// Process memory; lost on exit.
    Memory,
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Store backend (default: file).
    #[serde(default)]
    pub store: CheckpointStoreKind,

    /// Directory of the file store (default: .cdc-reconcile/checkpoints).
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,

    /// Database of the postgres store. Defaults to the target when it is PostgreSQL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<EndpointConfig>,

    /// Schema of the postgres store (default: cdc_reconcile).
    #[serde(default = "default_checkpoint_schema")]
    pub schema: String,

    /// Environment variable holding the file store signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac_key_env: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            store: CheckpointStoreKind::default(),
            path: default_checkpoint_path(),
            connection: None,
            schema: default_checkpoint_schema(),
            hmac_key_env: None,
        }
    }
}

// serde defaults
fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_leaf_size() -> usize {
    1_000
}

fn default_max_discrepancies() -> usize {
    10_000
}

fn default_job_timeout_secs() -> u64 {
    3_600
}

fn default_query_timeout_secs() -> u64 {
    300
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".cdc-reconcile/checkpoints")
}

fn default_checkpoint_schema() -> String {
    "cdc_reconcile".to_string()
}
