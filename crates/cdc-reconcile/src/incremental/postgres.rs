//! PostgreSQL-backed checkpoint storage.
//!
//! Checkpoints live in a `checkpoints` table inside a dedicated schema:
//! - Saves are a single upsert inside a transaction
//! - Several reconciler instances can share one store
//! - No file system access required

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::Config as PgConfig;
use tracing::info;

use super::{Checkpoint, CheckpointStore};
use crate::backend::tls::make_connector;
use crate::checksum::TableDigest;
use crate::config::EndpointConfig;
use crate::core::identifier::quote_pg;
use crate::core::KeyValue;
use crate::error::{ReconcileError, Result};
use crate::observe::Credentials;

const BACKEND: &str = "checkpoint-store";

/// Checkpoint store over a deadpool of PostgreSQL connections.
pub struct PgCheckpointStore {
    pool: Pool,
    schema: String,
}

impl PgCheckpointStore {
    /// Build a store for `endpoint`; connections open lazily.
    pub fn connect(endpoint: &EndpointConfig, credentials: Credentials, schema: &str) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config
            .host(&endpoint.host)
            .port(endpoint.port)
            .dbname(&endpoint.database)
            .user(&credentials.user)
            .password(&credentials.password)
            .application_name("cdc-reconcile-checkpoints")
            .connect_timeout(Duration::from_secs(endpoint.connect_timeout_secs));

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let max_size = endpoint.max_connections.unwrap_or(2);
        let pool = match make_connector(endpoint.ssl_mode)? {
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr).max_size(max_size).build()
            }
            None => {
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr).max_size(max_size).build()
            }
        }
        .map_err(|e| ReconcileError::Config(format!("creating checkpoint store pool: {}", e)))?;

        Self::new(pool, schema)
    }

    /// Wrap an existing pool.
    pub fn new(pool: Pool, schema: &str) -> Result<Self> {
        Ok(Self {
            pool,
            schema: quote_pg(schema)?,
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| ReconcileError::connectivity(BACKEND, e.to_string()))
    }

    fn table(&self) -> String {
        format!("{}.checkpoints", self.schema)
    }
}

fn from_row(row: &tokio_postgres::Row) -> Result<Checkpoint> {
    let table: String = row.get(0);
    let watermark: Option<serde_json::Value> = row.get(1);
    let checksum: String = row.get(2);
    let updated_at: DateTime<Utc> = row.get(3);

    let watermark = watermark
        .map(serde_json::from_value::<KeyValue>)
        .transpose()
        .map_err(|e| ReconcileError::Checkpoint(format!("{}: invalid watermark: {}", table, e)))?;
    Ok(Checkpoint {
        checksum: checksum.parse::<TableDigest>()?,
        table,
        watermark,
        updated_at,
    })
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn init(&self) -> Result<()> {
        let conn = self.client().await?;
        conn.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema), &[])
            .await?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    table_name TEXT PRIMARY KEY,
                    watermark JSONB,
                    checksum TEXT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                )",
                self.table()
            ),
            &[],
        )
        .await?;
        info!("Checkpoint table {} ready", self.table());
        Ok(())
    }

    async fn load(&self, table: &str) -> Result<Option<Checkpoint>> {
        let conn = self.client().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT table_name, watermark, checksum, updated_at FROM {} WHERE table_name = $1",
                    self.table()
                ),
                &[&table],
            )
            .await?;
        row.as_ref().map(from_row).transpose()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let watermark = checkpoint
            .watermark
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let checksum = checkpoint.checksum.to_string();

        let mut conn = self.client().await?;
        let tx = conn.transaction().await?;
        tx.execute(
            &format!(
                "INSERT INTO {} (table_name, watermark, checksum, updated_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (table_name) DO UPDATE SET
                    watermark = EXCLUDED.watermark,
                    checksum = EXCLUDED.checksum,
                    updated_at = EXCLUDED.updated_at",
                self.table()
            ),
            &[
                &checkpoint.table,
                &watermark,
                &checksum,
                &checkpoint.updated_at,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.client().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT table_name, watermark, checksum, updated_at FROM {} ORDER BY table_name",
                    self.table()
                ),
                &[],
            )
            .await?;
        rows.iter().map(from_row).collect()
    }

    async fn remove(&self, table: &str) -> Result<bool> {
        let conn = self.client().await?;
        let deleted = conn
            .execute(
                &format!("DELETE FROM {} WHERE table_name = $1", self.table()),
                &[&table],
            )
            .await?;
        Ok(deleted > 0)
    }

    fn store_type(&self) -> &'static str {
        "postgres"
    }
}
