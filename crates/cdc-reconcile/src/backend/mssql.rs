//! SQL Server backend (Tiberius).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::core::{ColumnInfo, KeyValue, RowKey, SqlValue, TableRef};
use crate::dialect::{DialectKind, RenderedQuery, ScanRequest};
use crate::error::{ReconcileError, Result};
use crate::observe::Credentials;

use super::{Connection, ConnectionManager, RowSink};

const BACKEND: &str = "mssql";

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

/// TCP keepalive time and keepalive interval.
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type TdsClient = Client<Compat<TcpStream>>;

/// Opens Tiberius connections for the pool.
pub struct MssqlManager {
    host: String,
    port: u16,
    database: String,
    user: String,
    password: String,
    encrypt: bool,
    trust_server_cert: bool,
    connect_timeout: Duration,
}

impl MssqlManager {
    pub fn new(endpoint: &EndpointConfig, credentials: Credentials) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            database: endpoint.database.clone(),
            user: credentials.user,
            password: credentials.password,
            encrypt: endpoint.encrypt,
            trust_server_cert: endpoint.trust_server_cert,
            connect_timeout: Duration::from_secs(endpoint.connect_timeout_secs),
        }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);
        config.application_name("cdc-reconcile");
        config.authentication(AuthMethod::sql_server(&self.user, &self.password));
        if self.encrypt {
            if self.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }
        config.packet_size(TDS_MAX_PACKET_SIZE);
        config
    }

    async fn open_socket(&self, addr: String) -> Result<TcpStream> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ReconcileError::timeout(format!("connect to {}", addr), self.connect_timeout))?
            .map_err(|e| ReconcileError::connectivity(BACKEND, format!("{}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();

        let std_tcp = tcp
            .into_std()
            .map_err(|e| ReconcileError::connectivity(BACKEND, e.to_string()))?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("{}: could not enable TCP keepalive: {}", addr, e);
        }
        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp
            .set_nonblocking(true)
            .map_err(|e| ReconcileError::connectivity(BACKEND, e.to_string()))?;
        TcpStream::from_std(std_tcp).map_err(|e| ReconcileError::connectivity(BACKEND, e.to_string()))
    }
}

#[async_trait]
impl ConnectionManager for MssqlManager {
    fn kind(&self) -> DialectKind {
        DialectKind::Mssql
    }

    fn describe(&self) -> String {
        format!("mssql://{}:{}/{}", self.host, self.port, self.database)
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let config = self.build_config();
        let tcp = self.open_socket(config.get_addr().to_string()).await?;
        let client = Client::connect(config, tcp.compat_write()).await?;
        debug!("connected to {}", self.describe());
        Ok(Box::new(MssqlConnection {
            client,
            broken: false,
        }))
    }
}

/// One Tiberius client.
pub struct MssqlConnection {
    client: TdsClient,
    broken: bool,
}

fn bind_params<'a>(query: &mut Query<'a>, params: &[KeyValue]) {
    for p in params {
        match p.clone() {
            KeyValue::Int(v) => query.bind(v),
            KeyValue::Decimal(v) => match tiberius::ToSql::to_sql(&v) {
                ColumnData::Numeric(n) => query.bind(n),
                _ => unreachable!("Decimal always encodes as Numeric"),
            },
            KeyValue::Text(v) => query.bind(v),
            KeyValue::Uuid(v) => query.bind(v),
            KeyValue::DateTime(v) => query.bind(v),
            KeyValue::Date(v) => query.bind(v),
            KeyValue::Time(v) => query.bind(v),
            KeyValue::Bytes(v) => query.bind(v),
        }
    }
}

fn decode(data: ColumnData<'static>) -> Result<SqlValue> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| SqlValue::I16(i16::from(v))),
        ColumnData::I16(v) => v.map(SqlValue::I16),
        ColumnData::I32(v) => v.map(SqlValue::I32),
        ColumnData::I64(v) => v.map(SqlValue::I64),
        ColumnData::F32(v) => v.map(SqlValue::F32),
        ColumnData::F64(v) => v.map(SqlValue::F64),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.map(|s| SqlValue::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map(SqlValue::Uuid),
        ColumnData::Binary(v) => v.map(|b| SqlValue::Bytes(b.into_owned())),
        ColumnData::Xml(v) => v.map(|x| SqlValue::Text(x.into_owned().into_string())),
        ColumnData::Numeric(_) => Decimal::from_sql(&data)?.map(SqlValue::Decimal),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data)?.map(SqlValue::DateTime)
        }
        ColumnData::DateTimeOffset(_) => {
            DateTime::<FixedOffset>::from_sql(&data)?.map(SqlValue::DateTimeOffset)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(&data)?.map(SqlValue::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(&data)?.map(SqlValue::Time),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

impl MssqlConnection {
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.poisons_connection() {
                self.broken = true;
            }
        }
        result
    }

    async fn first_row(&mut self, rendered: RenderedQuery) -> Result<Option<Vec<SqlValue>>> {
        let mut query = Query::new(rendered.sql);
        bind_params(&mut query, &rendered.params);
        let row = query.query(&mut self.client).await?.into_row().await?;
        row.map(|r| r.into_iter().map(decode).collect::<Result<Vec<_>>>())
            .transpose()
    }
}

#[async_trait]
impl Connection for MssqlConnection {
    fn kind(&self) -> DialectKind {
        DialectKind::Mssql
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn ping(&mut self) -> Result<()> {
        let result: Result<()> = async {
            self.client.simple_query("SELECT 1").await?.into_row().await?;
            Ok(())
        }
        .await;
        self.track(result)
    }

    async fn list_columns(&mut self, table: &TableRef) -> Result<Vec<ColumnInfo>> {
        let rendered = DialectKind::Mssql.dialect().build_list_columns(table);
        let result: Result<Vec<ColumnInfo>> = async {
            let mut query = Query::new(rendered.sql);
            bind_params(&mut query, &rendered.params);
            let rows = query.query(&mut self.client).await?.into_first_result().await?;
            Ok(rows
                .iter()
                .filter_map(|r| {
                    let name = r.get::<&str, _>(0)?;
                    let data_type = r.get::<&str, _>(1).unwrap_or_default();
                    Some(ColumnInfo::new(name, data_type))
                })
                .collect())
        }
        .await;
        self.track(result)
    }

    async fn count(&mut self, req: &ScanRequest) -> Result<u64> {
        let rendered = DialectKind::Mssql.dialect().build_count(req)?;
        let result: Result<u64> = async {
            match self.first_row(rendered).await?.and_then(|r| r.into_iter().next()) {
                Some(SqlValue::I64(n)) => Ok(n.max(0) as u64),
                Some(SqlValue::I32(n)) => Ok(n.max(0) as u64),
                other => Err(ReconcileError::query(
                    BACKEND,
                    format!("unexpected count result {:?}", other),
                )),
            }
        }
        .await;
        self.track(result)
    }

    async fn scan(&mut self, req: &ScanRequest, sink: &mut RowSink<'_>) -> Result<u64> {
        let rendered = DialectKind::Mssql.dialect().build_scan(req)?;
        let result: Result<u64> = async {
            let mut query = Query::new(rendered.sql);
            bind_params(&mut query, &rendered.params);
            let mut stream = query.query(&mut self.client).await?.into_row_stream();
            let mut n = 0u64;
            while let Some(row) = stream.try_next().await? {
                let values = row.into_iter().map(decode).collect::<Result<Vec<_>>>()?;
                sink(values)?;
                n += 1;
            }
            Ok(n)
        }
        .await;
        self.track(result)
    }

    async fn key_at(&mut self, req: &ScanRequest, offset: u64) -> Result<Option<RowKey>> {
        let rendered = DialectKind::Mssql.dialect().build_key_at(req, offset)?;
        let key_len = req.key_columns.len();
        let result: Result<Option<RowKey>> = async {
            match self.first_row(rendered).await? {
                Some(row) => RowKey::from_row(&row, key_len).map(Some),
                None => Ok(None),
            }
        }
        .await;
        self.track(result)
    }

    async fn max_value(&mut self, table: &TableRef, column: &str) -> Result<Option<KeyValue>> {
        let rendered = DialectKind::Mssql.dialect().build_max(table, column)?;
        let result: Result<Option<KeyValue>> = async {
            match self.first_row(rendered).await?.and_then(|r| r.into_iter().next()) {
                None | Some(SqlValue::Null) => Ok(None),
                Some(value) => value.to_key().map(Some),
            }
        }
        .await;
        self.track(result)
    }
}
