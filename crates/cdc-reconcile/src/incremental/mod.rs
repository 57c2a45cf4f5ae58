//! Incremental state tracking.
//!
//! A [`Checkpoint`] records, per table, the watermark up to which source and
//! target were last found equal and the digest of everything below it. An
//! incremental run compares only the window `(watermark, high_mark]` and, on
//! a match, advances the checkpoint to `previous + delta`.
//!
//! Checkpoint writes are serialized per table through [`TableLock`]; only the
//! holder of a table's lock can save its checkpoint.

pub mod postgres;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::checksum::TableDigest;
use crate::compare;
use crate::core::KeyValue;
use crate::dialect::{ScanRequest, Window};
use crate::error::{ReconcileError, Result};
use crate::pool::Session;

pub use postgres::PgCheckpointStore;
pub use store::{open_store, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

/// Persisted progress of incremental reconciliation for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Table identity (`schema.table` on the source).
    pub table: String,
    /// Last watermark verified equal on both sides; `None` before any row.
    pub watermark: Option<KeyValue>,
    /// Digest of all rows at or below the watermark.
    pub checksum: TableDigest,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(table: impl Into<String>, watermark: Option<KeyValue>, checksum: TableDigest) -> Self {
        Self {
            table: table.into(),
            watermark,
            checksum,
            updated_at: Utc::now(),
        }
    }
}

/// Exclusive right to write one table's checkpoint.
pub struct TableLock {
    table: String,
    _guard: OwnedMutexGuard<()>,
}

impl TableLock {
    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Loads, computes and saves incremental checkpoints.
pub struct IncrementalTracker {
    store: Arc<dyn CheckpointStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IncrementalTracker {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Wait for and take the checkpoint lock of `table`.
    pub async fn lock(&self, table: &str) -> TableLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(table.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        TableLock {
            table: table.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    pub async fn load_checkpoint(&self, table: &str) -> Result<Option<Checkpoint>> {
        let checkpoint = self.store.load(table).await?;
        match &checkpoint {
            Some(cp) => debug!(
                "{}: loaded checkpoint at watermark {} ({} rows)",
                table,
                describe(cp.watermark.as_ref()),
                cp.checksum.rows()
            ),
            None => debug!("{}: no checkpoint", table),
        }
        Ok(checkpoint)
    }

    /// Current high mark of the watermark column on `req`'s table.
    pub async fn high_mark(session: &mut Session, req: &ScanRequest, column: &str) -> Result<Option<KeyValue>> {
        compare::max_value(session, &req.table, column).await
    }

    /// Window of rows above the checkpoint up to `up_to`.
    ///
    /// Without a checkpoint the window starts at the bottom of the domain.
    pub fn delta_window(column: &str, checkpoint: Option<&Checkpoint>, up_to: Option<KeyValue>) -> Window {
        Window {
            column: column.to_string(),
            after: checkpoint.and_then(|cp| cp.watermark.clone()),
            up_to,
        }
    }

    /// Digest of the rows of `req` inside `window`.
    ///
    /// The window predicate is a range on the watermark column, so an index
    /// on it serves the scan.
    pub async fn compute_incremental_checksum(
        session: &mut Session,
        req: &ScanRequest,
        window: &Window,
        chunk_size: Option<usize>,
    ) -> Result<TableDigest> {
        let req = req.clone().with_window(Some(window.clone()));
        compare::checksum(session, &req, chunk_size).await
    }

    /// Persist a new checkpoint for the locked table.
    ///
    /// The watermark never moves backwards unless `resync` is set. Any
    /// failure is reported as [`ReconcileError::CheckpointWrite`] and leaves
    /// the stored checkpoint as it was.
    pub async fn save_checkpoint(
        &self,
        lock: &TableLock,
        watermark: Option<KeyValue>,
        checksum: TableDigest,
        resync: bool,
    ) -> Result<Checkpoint> {
        let table = lock.table();
        if !resync {
            let previous = self
                .store
                .load(table)
                .await
                .map_err(|e| ReconcileError::checkpoint_write(table, e.to_string()))?;
            if let Some(previous) = previous {
                if previous.watermark > watermark {
                    return Err(ReconcileError::checkpoint_write(
                        table,
                        format!(
                            "watermark would regress from {} to {}",
                            describe(previous.watermark.as_ref()),
                            describe(watermark.as_ref())
                        ),
                    ));
                }
            }
        }

        let checkpoint = Checkpoint::new(table, watermark, checksum);
        if let Err(e) = self.store.save(&checkpoint).await {
            warn!("{}: checkpoint not advanced: {}", table, e);
            return Err(ReconcileError::checkpoint_write(table, e.to_string()));
        }
        info!(
            "{}: checkpoint saved at watermark {} ({} rows)",
            table,
            describe(checkpoint.watermark.as_ref()),
            checkpoint.checksum.rows()
        );
        Ok(checkpoint)
    }

    /// Drop the checkpoint of `table`, forcing the next run to start over.
    pub async fn reset(&self, table: &str) -> Result<bool> {
        let lock = self.lock(table).await;
        let removed = self.store.remove(lock.table()).await?;
        if removed {
            info!("{}: checkpoint reset", table);
        }
        Ok(removed)
    }
}

fn describe(watermark: Option<&KeyValue>) -> String {
    watermark.map_or_else(|| "<none>".to_string(), |w| w.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::compare::tests::{session_for, users_db, users_plan};
    use crate::core::{SqlValue, TableRef};
    use crate::dialect::DialectKind;

    fn tracker() -> (IncrementalTracker, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new());
        (IncrementalTracker::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_delta_checksum_covers_only_new_rows() {
        let rows: Vec<(i64, &str)> = (1..=10).map(|i| (i, "a")).collect();
        let db = users_db(DialectKind::Mssql, "dbo", &rows);
        let plan = users_plan();
        let mut session = session_for(&db, "source");

        let full = compare::calculate_checksum(&mut session, &plan.source).await.unwrap();
        let base = Checkpoint::new("dbo.users", Some(KeyValue::Int(10)), full);

        let table = TableRef::new("dbo", "users");
        for id in 11..=14 {
            db.insert(
                &table,
                vec![SqlValue::I64(id), SqlValue::Text("b".into()), SqlValue::Bool(false)],
            )
            .unwrap();
        }

        let high = IncrementalTracker::high_mark(&mut session, &plan.source, "id")
            .await
            .unwrap();
        assert_eq!(high, Some(KeyValue::Int(14)));
        let window = IncrementalTracker::delta_window("id", Some(&base), high);
        let delta = IncrementalTracker::compute_incremental_checksum(&mut session, &plan.source, &window, Some(3))
            .await
            .unwrap();
        assert_eq!(delta.rows(), 4);

        let after = compare::calculate_checksum(&mut session, &plan.source).await.unwrap();
        assert_eq!(base.checksum.combined(&delta), after);
    }

    #[tokio::test]
    async fn test_save_requires_monotonic_watermark() {
        let (tracker, _store) = tracker();
        let lock = tracker.lock("dbo.users").await;
        tracker
            .save_checkpoint(&lock, Some(KeyValue::Int(10)), TableDigest::empty(), false)
            .await
            .unwrap();

        let err = tracker
            .save_checkpoint(&lock, Some(KeyValue::Int(5)), TableDigest::empty(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::CheckpointWrite { .. }));

        let cp = tracker
            .save_checkpoint(&lock, Some(KeyValue::Int(5)), TableDigest::empty(), true)
            .await
            .unwrap();
        assert_eq!(cp.watermark, Some(KeyValue::Int(5)));
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_checkpoint() {
        let (tracker, store) = tracker();
        let lock = tracker.lock("dbo.users").await;
        tracker
            .save_checkpoint(&lock, Some(KeyValue::Int(1)), TableDigest::empty(), false)
            .await
            .unwrap();

        store.fail_next_saves(1);
        let err = tracker
            .save_checkpoint(&lock, Some(KeyValue::Int(2)), TableDigest::empty(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dbo.users"));

        let cp = tracker.load_checkpoint("dbo.users").await.unwrap().unwrap();
        assert_eq!(cp.watermark, Some(KeyValue::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_serializes_writers_per_table() {
        let (tracker, _store) = tracker();
        let tracker = Arc::new(tracker);

        let held = tracker.lock("dbo.a").await;
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let _lock = tracker.lock("dbo.a").await;
            })
        };
        // other tables are not blocked
        let _other = tracker.lock("dbo.b").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_removes_checkpoint() {
        let (tracker, _store) = tracker();
        {
            let lock = tracker.lock("dbo.users").await;
            tracker
                .save_checkpoint(&lock, None, TableDigest::empty(), false)
                .await
                .unwrap();
        }
        assert!(tracker.reset("dbo.users").await.unwrap());
        assert!(!tracker.reset("dbo.users").await.unwrap());
        assert!(tracker.load_checkpoint("dbo.users").await.unwrap().is_none());
    }
}
