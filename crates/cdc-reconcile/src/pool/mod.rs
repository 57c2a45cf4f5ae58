//! Bounded, health-checked connection pool.
//!
//! Capacity is enforced by a semaphore: each leased connection holds one
//! permit, so at most `max_size` connections exist at any time. Idle
//! connections live in a mutex-protected queue that is only touched for
//! O(1) push/pop; no lock is held across a network call.
//!
//! Lifecycle of a connection: `Idle -> Leased -> {Idle, Discarded}`, and
//! the pool itself ends in `Closed`, after which every acquisition fails
//! with [`ReconcileError::PoolClosed`].

mod session;

pub use session::Session;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::backend::{Connection, ConnectionManager};
use crate::dialect::DialectKind;
use crate::error::{ReconcileError, Result};
use crate::retry::RetryPolicy;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections.
    pub max_size: usize,
    /// Default acquisition timeout.
    pub acquire_timeout: Duration,
    /// Connections idle longer than this are discarded at checkout.
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are discarded at checkout.
    pub max_lifetime: Option<Duration>,
    /// Ping idle connections before handing them out.
    pub test_on_checkout: bool,
    /// Policy used when opening replacement connections.
    pub connect_retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(300)),
            max_lifetime: Some(Duration::from_secs(1800)),
            test_on_checkout: true,
            connect_retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            ..Self::default()
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn with_test_on_checkout(mut self, test: bool) -> Self {
        self.test_on_checkout = test;
        self
    }

    pub fn with_connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub discarded: u64,
    pub acquired: u64,
    pub replaced: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct AtomicPoolStats {
    created: AtomicU64,
    discarded: AtomicU64,
    acquired: AtomicU64,
    replaced: AtomicU64,
    timeouts: AtomicU64,
}

struct IdleEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used_at: Instant,
}

struct PoolInner {
    name: String,
    manager: Arc<dyn ConnectionManager>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleEntry>>,
    size: AtomicUsize,
    closed: AtomicBool,
    stats: AtomicPoolStats,
}

impl PoolInner {
    fn discard(&self, reason: &str) {
        self.size.fetch_sub(1, Ordering::AcqRel);
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        debug!("{}: discarded connection ({})", self.name, reason);
    }

    fn push_idle(&self, entry: IdleEntry) {
        match self.idle.lock() {
            Ok(mut idle) => idle.push_back(entry),
            Err(poisoned) => poisoned.into_inner().push_back(entry),
        }
    }

    fn pop_idle(&self) -> Option<IdleEntry> {
        match self.idle.lock() {
            Ok(mut idle) => idle.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    fn idle_len(&self) -> usize {
        match self.idle.lock() {
            Ok(idle) => idle.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn is_expired(&self, entry: &IdleEntry, now: Instant) -> Option<&'static str> {
        if let Some(lifetime) = self.config.max_lifetime {
            if now.duration_since(entry.created_at) >= lifetime {
                return Some("max lifetime reached");
            }
        }
        if let Some(idle) = self.config.idle_timeout {
            if now.duration_since(entry.last_used_at) >= idle {
                return Some("idle timeout");
            }
        }
        None
    }
}

/// Idle connection taken off the queue for checkout.
///
/// Counted out of the pool on drop unless [`take`](Self::take)n, so an
/// acquisition cancelled mid-check leaves `size` accurate.
struct Candidate<'a> {
    pool: &'a PoolInner,
    entry: Option<IdleEntry>,
}

impl<'a> Candidate<'a> {
    fn new(pool: &'a PoolInner, entry: IdleEntry) -> Self {
        Self {
            pool,
            entry: Some(entry),
        }
    }

    /// Expiry, breakage and (when configured) a ping.
    async fn check(&mut self) -> std::result::Result<(), &'static str> {
        let pool = self.pool;
        let Some(entry) = self.entry.as_mut() else {
            return Err("already taken");
        };
        if let Some(reason) = pool.is_expired(entry, Instant::now()) {
            return Err(reason);
        }
        if entry.conn.is_broken() {
            pool.stats.replaced.fetch_add(1, Ordering::Relaxed);
            return Err("broken");
        }
        if pool.config.test_on_checkout {
            if let Err(e) = entry.conn.ping().await {
                warn!("{}: liveness check failed, replacing connection: {}", pool.name, e);
                pool.stats.replaced.fetch_add(1, Ordering::Relaxed);
                return Err("failed liveness check");
            }
        }
        Ok(())
    }

    fn take(mut self) -> Option<IdleEntry> {
        self.entry.take()
    }

    fn discard(mut self, reason: &str) {
        if self.entry.take().is_some() {
            self.pool.discard(reason);
        }
    }
}

impl Drop for Candidate<'_> {
    fn drop(&mut self) {
        if self.entry.take().is_some() {
            self.pool.discard("checkout abandoned");
        }
    }
}

/// Explicitly constructed pool of connections to one backend.
///
/// Cloning is cheap and shares the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("max_size", &self.inner.config.max_size)
            .finish()
    }
}

impl Pool {
    /// Create a pool. No connection is opened until the first acquisition.
    pub fn new(name: impl Into<String>, manager: Arc<dyn ConnectionManager>, config: PoolConfig) -> Self {
        let name = name.into();
        info!(
            "{}: pool for {} (max_size={}, acquire_timeout={:?})",
            name,
            manager.describe(),
            config.max_size,
            config.acquire_timeout
        );
        Self {
            inner: Arc::new(PoolInner {
                name,
                manager,
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                config,
                idle: Mutex::new(VecDeque::new()),
                size: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                stats: AtomicPoolStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> DialectKind {
        self.inner.manager.kind()
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.max_size
    }

    pub fn default_acquire_timeout(&self) -> Duration {
        self.inner.config.acquire_timeout
    }

    /// Number of live connections (idle + leased).
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let stats = &self.inner.stats;
        PoolStats {
            max_size: self.inner.config.max_size,
            size: self.size(),
            idle: self.inner.idle_len(),
            in_use: self
                .inner
                .config
                .max_size
                .saturating_sub(self.inner.semaphore.available_permits()),
            created: stats.created.load(Ordering::Relaxed),
            discarded: stats.discarded.load(Ordering::Relaxed),
            acquired: stats.acquired.load(Ordering::Relaxed),
            replaced: stats.replaced.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
        }
    }

    fn closed_error(&self) -> ReconcileError {
        ReconcileError::PoolClosed {
            backend: self.inner.name.clone(),
        }
    }

    /// Lease a connection within `timeout`.
    ///
    /// The deadline covers the permit wait, liveness checks and any
    /// replacement connect. Idle connections failing the check are
    /// discarded and replaced rather than reported.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        match tokio::time::timeout(timeout, self.checkout()).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(ReconcileError::PoolExhausted {
                    backend: self.inner.name.clone(),
                    waited: timeout,
                })
            }
        }
    }

    async fn checkout(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.closed_error())?;

        while let Some(entry) = self.inner.pop_idle() {
            let mut candidate = Candidate::new(&self.inner, entry);
            if let Err(reason) = candidate.check().await {
                candidate.discard(reason);
                continue;
            }
            if let Some(entry) = candidate.take() {
                self.inner.stats.acquired.fetch_add(1, Ordering::Relaxed);
                return Ok(self.lease(entry.conn, entry.created_at, permit));
            }
        }

        if self.is_closed() {
            return Err(self.closed_error());
        }

        let manager = self.inner.manager.clone();
        let operation = format!("{}: connect", self.inner.name);
        let conn = self
            .inner
            .config
            .connect_retry
            .execute(&operation, || manager.connect())
            .await?;

        self.inner.size.fetch_add(1, Ordering::AcqRel);
        self.inner.stats.created.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.acquired.fetch_add(1, Ordering::Relaxed);
        debug!("{}: opened connection (size={})", self.inner.name, self.size());
        Ok(self.lease(conn, Instant::now(), permit))
    }

    fn lease(&self, conn: Box<dyn Connection>, created_at: Instant, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            created_at,
            last_used_at: Instant::now(),
            poisoned: false,
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    /// Return a leased connection. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close the pool: idle connections are dropped, waiters and future
    /// acquisitions fail with `PoolClosed`, leased connections are discarded
    /// when returned.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        while self.inner.pop_idle().is_some() {
            self.inner.discard("pool closed");
        }
        info!("{}: pool closed", self.inner.name);
    }
}

/// A connection leased from a [`Pool`].
///
/// Dropping it returns the connection to the idle queue, or discards it if
/// it was poisoned or the pool has been closed.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    last_used_at: Instant,
    poisoned: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Mark the connection unusable; it will be discarded on release.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Borrow the underlying connection for one operation.
    pub fn connection(&mut self) -> Result<&mut dyn Connection> {
        self.last_used_at = Instant::now();
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(ReconcileError::PoolClosed {
                backend: self.pool.name.clone(),
            }),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.poisoned {
            self.pool.discard("poisoned");
        } else if self.pool.closed.load(Ordering::Acquire) {
            self.pool.discard("pool closed");
        } else if conn.is_broken() {
            self.pool.discard("broken");
        } else {
            self.pool.push_idle(IdleEntry {
                conn,
                created_at: self.created_at,
                last_used_at: Instant::now(),
            });
        }
        // permit is released after this, waking the next waiter
    }
}
