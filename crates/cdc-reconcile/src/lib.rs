//! # cdc-reconcile
//!
//! Consistency verification between a CDC-replicated source and target
//! database.
//!
//! This library provides the reconciliation engine with support for:
//!
//! - **Row count and checksum comparison** computed client-side over a
//!   canonical encoding, so SQL Server and PostgreSQL hash identical bytes
//! - **Chunked checksums** over primary-key ranges for tables too large to
//!   scan in one pass
//! - **Incremental reconciliation** from HMAC-signed or database-backed
//!   checkpoints
//! - **Row-level localization** of divergent keys by range bisection, with
//!   generated repair scripts
//! - **Parallel scheduling** of table jobs over bounded connection pools
//!   with retry, timeouts and failure isolation
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cdc_reconcile::observe::ConfigCredentials;
//! use cdc_reconcile::{jobs_from_config, open_store, Config, IncrementalTracker, Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> cdc_reconcile::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let store = open_store(&config, &ConfigCredentials).await?;
//!     let tracker = Arc::new(IncrementalTracker::new(store));
//!     let scheduler = Scheduler::from_config(&config, &ConfigCredentials, Some(tracker)).await?;
//!     let report = scheduler
//!         .run(jobs_from_config(&config, false), config.reconcile.get_workers())
//!         .await;
//!     println!("{} of {} tables matched", report.totals.matched, report.totals.tables);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod checksum;
pub mod compare;
pub mod config;
pub mod core;
pub mod dialect;
pub mod error;
pub mod incremental;
pub mod observe;
pub mod pool;
pub mod reconciler;
pub mod retry;
pub mod rowlevel;
pub mod scheduler;

// Re-exports for convenient access
pub use checksum::{RowHasher, TableDigest};
pub use compare::{CompareOptions, Comparator, ComparisonResult, TablePlan};
pub use config::{CheckpointStoreKind, Config, EndpointConfig, ReconcileConfig};
pub use crate::core::{KeyValue, RowKey, SqlValue, TableRef, TableSpec};
pub use error::{JobFailure, ReconcileError, Result};
pub use incremental::{open_store, Checkpoint, CheckpointStore, IncrementalTracker};
pub use pool::{Pool, PoolConfig, PoolStats, Session};
pub use reconciler::{ReconcileMode, ReconcileOptions, Reconciler, TableOutcome};
pub use retry::RetryPolicy;
pub use rowlevel::{Discrepancy, DiscrepancyKind, RepairScript, RowLevelReconciler};
pub use scheduler::{jobs_from_config, estimate_optimal_workers, HealthReport, Job, RunReport, Scheduler};
