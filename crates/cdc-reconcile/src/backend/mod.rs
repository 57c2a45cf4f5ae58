//! Database backends.
//!
//! A [`Connection`] is one live handle to a backend that can answer the
//! engine's reads. [`ConnectionManager`] creates them for the pool.
//!
//! - [`mssql`]: SQL Server via Tiberius
//! - [`postgres`]: PostgreSQL via tokio-postgres with rustls
//! - [`memory`]: in-process tables evaluated directly, with fault injection

pub mod memory;
pub mod mssql;
pub mod postgres;
pub mod tls;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EndpointConfig;
use crate::core::{ColumnInfo, KeyValue, Row, RowKey, TableRef};
use crate::dialect::{DialectKind, ScanRequest};
use crate::error::Result;
use crate::observe::Credentials;

pub use memory::{MemoryDatabase, MemoryManager};
pub use mssql::MssqlManager;
pub use postgres::PostgresManager;

/// Callback receiving each row of a scan, in key order.
pub type RowSink<'a> = dyn FnMut(Row) -> Result<()> + Send + 'a;

/// One live connection.
#[async_trait]
pub trait Connection: Send {
    /// Backend family of this connection.
    fn kind(&self) -> DialectKind;

    /// Whether the connection is known to be unusable without a round trip.
    fn is_broken(&self) -> bool {
        false
    }

    /// Lightweight liveness check.
    async fn ping(&mut self) -> Result<()>;

    /// Columns of a table in ordinal order.
    async fn list_columns(&mut self, table: &TableRef) -> Result<Vec<ColumnInfo>>;

    /// Number of rows matched by the request.
    async fn count(&mut self, req: &ScanRequest) -> Result<u64>;

    /// Stream matched rows ordered by key into `sink`. Returns rows streamed.
    async fn scan(&mut self, req: &ScanRequest, sink: &mut RowSink<'_>) -> Result<u64>;

    /// Key of the row at zero-based `offset` in key order, if any.
    async fn key_at(&mut self, req: &ScanRequest, offset: u64) -> Result<Option<RowKey>>;

    /// Largest value of `column`, or `None` for an empty table.
    async fn max_value(&mut self, table: &TableRef, column: &str) -> Result<Option<KeyValue>>;
}

/// Creates connections for a [`Pool`](crate::pool::Pool).
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Backend family of created connections.
    fn kind(&self) -> DialectKind;

    /// Human-readable endpoint for logs (never includes credentials).
    fn describe(&self) -> String;

    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// Build the manager for a configured endpoint.
pub fn manager_for(
    endpoint: &EndpointConfig,
    credentials: Credentials,
) -> Result<Arc<dyn ConnectionManager>> {
    Ok(match endpoint.r#type {
        DialectKind::Mssql => Arc::new(MssqlManager::new(endpoint, credentials)),
        DialectKind::Postgres => Arc::new(PostgresManager::new(endpoint, credentials)?),
    })
}
