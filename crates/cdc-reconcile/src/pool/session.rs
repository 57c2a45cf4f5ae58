//! Retrying, timeout-bounded execution of backend calls.

use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::backend::Connection;
use crate::error::{ReconcileError, Result};
use crate::retry::RetryPolicy;

use super::{Pool, PooledConnection};

/// A worker's exclusive lease on one backend.
///
/// Holds at most one connection at a time and runs each operation under the
/// query timeout and the retry policy. A connection that failed with a
/// connection-invalidating error is discarded and the next attempt leases a
/// fresh one, so retries never reuse a broken handle.
pub struct Session {
    pool: Pool,
    policy: RetryPolicy,
    query_timeout: Duration,
    acquire_timeout: Duration,
    conn: Option<PooledConnection>,
}

impl Session {
    pub fn new(pool: Pool, policy: RetryPolicy, query_timeout: Duration) -> Self {
        let acquire_timeout = pool.default_acquire_timeout();
        Self {
            pool,
            policy,
            query_timeout,
            acquire_timeout,
            conn: None,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn backend(&self) -> &str {
        self.pool.name()
    }

    async fn leased(&mut self) -> Result<&mut PooledConnection> {
        if self.conn.is_none() {
            self.conn = Some(self.pool.acquire(self.acquire_timeout).await?);
        }
        match self.conn.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(ReconcileError::PoolClosed {
                backend: self.pool.name().to_string(),
            }),
        }
    }

    /// Run one backend operation with timeout and retries.
    ///
    /// `op` must be restartable: it is called once per attempt and any state
    /// it accumulates must be created inside the returned future.
    pub async fn run<T, F>(&mut self, operation: &str, mut op: F) -> Result<T>
    where
        F: for<'c> FnMut(&'c mut dyn Connection) -> BoxFuture<'c, Result<T>>,
    {
        let query_timeout = self.query_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;

            // pool exhaustion is surfaced as is
            let leased = self.leased().await?;

            let outcome = {
                let conn = leased.connection()?;
                match tokio::time::timeout(query_timeout, op(conn)).await {
                    Ok(result) => result,
                    Err(_) => Err(ReconcileError::timeout(operation, query_timeout)),
                }
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.poisons_connection() {
                if let Some(mut conn) = self.conn.take() {
                    conn.poison();
                }
                debug!("{}: discarded connection after: {}", self.pool.name(), err);
            }

            let message = err.to_string();
            let delay = self.policy.on_failure(err, attempt)?;
            warn!(
                "{}: {} attempt {}/{} failed: {}. Retrying in {:?}",
                self.pool.name(),
                operation,
                attempt,
                self.policy.max_attempts(),
                message,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Return the held connection to the pool.
    pub fn release(&mut self) {
        self.conn = None;
    }

    /// Drop the held connection without returning it to the idle queue.
    ///
    /// Used after an operation was abandoned mid-flight, when the
    /// connection may still be inside a query.
    pub fn discard(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.poison();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use futures::FutureExt;

    use crate::backend::memory::{Fault, MemoryDatabase, MemoryManager};
    use crate::core::{SqlValue, TableRef};
    use crate::dialect::{DialectKind, ScanRequest};
    use crate::pool::PoolConfig;

    fn setup() -> (Arc<MemoryDatabase>, Arc<MemoryManager>, Session) {
        let db = Arc::new(MemoryDatabase::new(DialectKind::Postgres));
        db.create_table(TableRef::new("public", "t"), &["id", "v"], &["id"])
            .unwrap();
        db.insert(
            &TableRef::new("public", "t"),
            vec![SqlValue::I64(1), SqlValue::Text("a".into())],
        )
        .unwrap();
        let manager = Arc::new(MemoryManager::new(db.clone()));
        let pool = Pool::new("target", manager.clone(), PoolConfig::new(2));
        let policy = RetryPolicy::new(3)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false);
        let session = Session::new(pool, policy, Duration::from_millis(200));
        (db, manager, session)
    }

    fn count_req() -> ScanRequest {
        ScanRequest::new(TableRef::new("public", "t"), vec!["id".into()], vec![])
    }

    #[tokio::test]
    async fn test_run_reuses_connection() {
        let (_, manager, mut session) = setup();
        let req = count_req();
        for _ in 0..3 {
            let req = req.clone();
            let n = session
                .run("count", move |c| {
                    let req = req.clone();
                    async move { c.count(&req).await }.boxed()
                })
                .await
                .unwrap();
            assert_eq!(n, 1);
        }
        assert_eq!(manager.connects(), 1);
    }

    #[tokio::test]
    async fn test_connectivity_failure_replaces_connection() {
        let (db, manager, mut session) = setup();
        db.inject(Fault::Query, 1, || {
            ReconcileError::connectivity("postgres", "connection reset")
        });
        let req = count_req();
        let n = session
            .run("count", move |c| {
                let req = req.clone();
                async move { c.count(&req).await }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(manager.connects(), 2);
        assert_eq!(session.pool().stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_query_error_is_not_retried() {
        let (db, _, mut session) = setup();
        db.inject(Fault::Query, 5, || ReconcileError::query("postgres", "permission denied"));
        let req = count_req();
        let err = session
            .run("count", move |c| {
                let req = req.clone();
                async move { c.count(&req).await }.boxed()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Query { .. }));
        assert_eq!(db.remaining_faults(Fault::Query), 4);
    }

    #[tokio::test]
    async fn test_slow_query_times_out_and_exhausts() {
        let (db, _, session) = setup();
        let mut session = Session {
            query_timeout: Duration::from_millis(10),
            ..session
        };
        db.set_latency(Some(Duration::from_millis(100)));
        let req = count_req();
        let err = session
            .run("checksum", move |c| {
                let req = req.clone();
                async move { c.count(&req).await }.boxed()
            })
            .await
            .unwrap_err();
        match err {
            ReconcileError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ReconcileError::Timeout { .. }));
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
    }
}
