//! PostgreSQL backend (tokio-postgres over optional rustls).

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config as PgConfig, NoTls, Row as PgRow};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::core::{ColumnInfo, KeyValue, RowKey, SqlValue, TableRef};
use crate::dialect::{DialectKind, RenderedQuery, ScanRequest};
use crate::error::{ReconcileError, Result};
use crate::observe::Credentials;

use super::tls::make_connector;
use super::{Connection, ConnectionManager, RowSink};

/// TCP keepalive idle time.
const TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

type Params = Vec<Box<dyn ToSql + Sync + Send>>;

/// Opens tokio-postgres connections for the pool.
pub struct PostgresManager {
    config: PgConfig,
    tls: Option<MakeRustlsConnect>,
    describe: String,
}

impl PostgresManager {
    pub fn new(endpoint: &EndpointConfig, credentials: Credentials) -> Result<Self> {
        let mut config = PgConfig::new();
        config
            .host(&endpoint.host)
            .port(endpoint.port)
            .dbname(&endpoint.database)
            .user(&credentials.user)
            .password(&credentials.password)
            .application_name("cdc-reconcile")
            .connect_timeout(Duration::from_secs(endpoint.connect_timeout_secs))
            .keepalives(true)
            .keepalives_idle(TCP_KEEPALIVE_IDLE);

        let tls = make_connector(endpoint.ssl_mode)?;
        if tls.is_none() {
            warn!(
                "{}:{}: PostgreSQL TLS is disabled, credentials travel in plaintext",
                endpoint.host, endpoint.port
            );
        }

        Ok(Self {
            config,
            tls,
            describe: format!(
                "postgres://{}:{}/{} (sslmode={})",
                endpoint.host, endpoint.port, endpoint.database, endpoint.ssl_mode
            ),
        })
    }

    async fn open(&self) -> Result<Client> {
        let client = match &self.tls {
            Some(tls) => {
                let (client, connection) = self.config.connect(tls.clone()).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("postgres connection closed: {}", e);
                    }
                });
                client
            }
            None => {
                let (client, connection) = self.config.connect(NoTls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("postgres connection closed: {}", e);
                    }
                });
                client
            }
        };
        // timestamptz values are decoded and hashed in UTC
        client.batch_execute("SET TIME ZONE 'UTC'").await?;
        Ok(client)
    }
}

#[async_trait]
impl ConnectionManager for PostgresManager {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn describe(&self) -> String {
        self.describe.clone()
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let client = self.open().await?;
        debug!("connected to {}", self.describe);
        Ok(Box::new(PostgresConnection { client }))
    }
}

/// One tokio-postgres client.
pub struct PostgresConnection {
    client: Client,
}

fn to_params(values: &[KeyValue]) -> Params {
    values
        .iter()
        .map(|v| -> Box<dyn ToSql + Sync + Send> {
            match v.clone() {
                KeyValue::Int(v) => Box::new(v),
                KeyValue::Decimal(v) => Box::new(v),
                KeyValue::Text(v) => Box::new(v),
                KeyValue::Uuid(v) => Box::new(v),
                KeyValue::DateTime(v) => Box::new(v),
                KeyValue::Date(v) => Box::new(v),
                KeyValue::Time(v) => Box::new(v),
                KeyValue::Bytes(v) => Box::new(v),
            }
        })
        .collect()
}

fn decode_column(row: &PgRow, idx: usize) -> Result<SqlValue> {
    let type_name = row.columns()[idx].type_().name();
    let value = match type_name {
        "bool" => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        "int2" => row.try_get::<_, Option<i16>>(idx)?.map(SqlValue::I16),
        "int4" => row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::I32),
        "int8" => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::I64),
        "float4" => row.try_get::<_, Option<f32>>(idx)?.map(SqlValue::F32),
        "float8" => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::F64),
        "numeric" => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map(SqlValue::Decimal),
        "uuid" => row.try_get::<_, Option<uuid::Uuid>>(idx)?.map(SqlValue::Uuid),
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Bytes),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map(SqlValue::DateTime),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)?
            .map(SqlValue::DateTimeOffset),
        "date" => row.try_get::<_, Option<chrono::NaiveDate>>(idx)?.map(SqlValue::Date),
        "time" => row.try_get::<_, Option<chrono::NaiveTime>>(idx)?.map(SqlValue::Time),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| SqlValue::Text(v.to_string())),
        "text" | "varchar" | "bpchar" | "name" | "char" | "citext" | "unknown" => row
            .try_get::<_, Option<String>>(idx)?
            .map(SqlValue::Text),
        other => {
            return Err(ReconcileError::query(
                "postgres",
                format!(
                    "column {} has unsupported type {}",
                    row.columns()[idx].name(),
                    other
                ),
            ))
        }
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

fn decode_row(row: &PgRow) -> Result<Vec<SqlValue>> {
    (0..row.len()).map(|i| decode_column(row, i)).collect()
}

impl PostgresConnection {
    async fn first_row(&mut self, rendered: RenderedQuery) -> Result<Option<Vec<SqlValue>>> {
        let params = to_params(&rendered.params);
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client.query(rendered.sql.as_str(), &refs).await?;
        rows.first().map(decode_row).transpose()
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn is_broken(&self) -> bool {
        self.client.is_closed()
    }

    async fn ping(&mut self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn list_columns(&mut self, table: &TableRef) -> Result<Vec<ColumnInfo>> {
        let rendered = DialectKind::Postgres.dialect().build_list_columns(table);
        let params = to_params(&rendered.params);
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = self.client.query(rendered.sql.as_str(), &refs).await?;
        rows.iter()
            .map(|r| -> Result<ColumnInfo> {
                Ok(ColumnInfo::new(r.try_get::<_, String>(0)?, r.try_get::<_, String>(1)?))
            })
            .collect()
    }

    async fn count(&mut self, req: &ScanRequest) -> Result<u64> {
        let rendered = DialectKind::Postgres.dialect().build_count(req)?;
        match self.first_row(rendered).await?.and_then(|r| r.into_iter().next()) {
            Some(SqlValue::I64(n)) => Ok(n.max(0) as u64),
            other => Err(ReconcileError::query(
                "postgres",
                format!("unexpected count result {:?}", other),
            )),
        }
    }

    async fn scan(&mut self, req: &ScanRequest, sink: &mut RowSink<'_>) -> Result<u64> {
        let rendered = DialectKind::Postgres.dialect().build_scan(req)?;
        let params = to_params(&rendered.params);
        let stream = self
            .client
            .query_raw(rendered.sql.as_str(), params)
            .await?;
        futures::pin_mut!(stream);

        let mut n = 0u64;
        while let Some(row) = stream.try_next().await? {
            sink(decode_row(&row)?)?;
            n += 1;
        }
        Ok(n)
    }

    async fn key_at(&mut self, req: &ScanRequest, offset: u64) -> Result<Option<RowKey>> {
        let rendered = DialectKind::Postgres.dialect().build_key_at(req, offset)?;
        match self.first_row(rendered).await? {
            Some(row) => RowKey::from_row(&row, req.key_columns.len()).map(Some),
            None => Ok(None),
        }
    }

    async fn max_value(&mut self, table: &TableRef, column: &str) -> Result<Option<KeyValue>> {
        let rendered = DialectKind::Postgres.dialect().build_max(table, column)?;
        match self.first_row(rendered).await?.and_then(|r| r.into_iter().next()) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(value) => value.to_key().map(Some),
        }
    }
}
