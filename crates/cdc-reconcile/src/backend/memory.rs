//! In-process backend.
//!
//! Tables are held in memory and [`ScanRequest`]s are evaluated directly,
//! with the same semantics the SQL dialects render: half-open key ranges,
//! watermark windows and soft-delete filters. Faults (failed connects,
//! failed pings, query errors) and per-call latency can be injected to
//! exercise the pool, retry and scheduler paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{ColumnInfo, KeyValue, Row, RowKey, SoftDeleteStyle, SqlValue, TableRef};
use crate::dialect::{DialectKind, ScanRequest};
use crate::error::{ReconcileError, Result};

use super::{Connection, ConnectionManager, RowSink};

/// Injection point for a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Opening a connection.
    Connect,
    /// Liveness check of a pooled connection.
    Ping,
    /// Any read (count, scan, key lookup, max, column listing).
    Query,
}

type ErrorFactory = Arc<dyn Fn() -> ReconcileError + Send + Sync>;

struct FaultPlan {
    remaining: usize,
    make: ErrorFactory,
}

struct MemoryTable {
    columns: Vec<String>,
    key_positions: Vec<usize>,
    rows: BTreeMap<RowKey, Row>,
}

impl MemoryTable {
    fn position(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .or_else(|| self.columns.iter().position(|c| c.eq_ignore_ascii_case(column)))
    }
}

/// A set of in-memory tables standing in for one database.
pub struct MemoryDatabase {
    kind: DialectKind,
    tables: RwLock<HashMap<TableRef, MemoryTable>>,
    faults: Mutex<HashMap<Fault, FaultPlan>>,
    latency: Mutex<Option<Duration>>,
    stall_pings: AtomicBool,
    queries: AtomicU64,
}

impl MemoryDatabase {
    /// Empty database reporting itself as `kind`.
    pub fn new(kind: DialectKind) -> Self {
        Self {
            kind,
            tables: RwLock::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
            stall_pings: AtomicBool::new(false),
            queries: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> DialectKind {
        self.kind
    }

    fn backend(&self) -> &'static str {
        self.kind.as_str()
    }

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TableRef, MemoryTable>> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TableRef, MemoryTable>> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create (or replace) a table.
    pub fn create_table(&self, table: TableRef, columns: &[&str], key: &[&str]) -> Result<()> {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let key_positions = key
            .iter()
            .map(|k| {
                columns.iter().position(|c| c == k).ok_or_else(|| {
                    ReconcileError::Config(format!("{}: key column {} is not a column", table, k))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if key_positions.is_empty() {
            return Err(ReconcileError::Config(format!("{}: table needs a key", table)));
        }
        self.write_tables().insert(
            table,
            MemoryTable {
                columns,
                key_positions,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn drop_table(&self, table: &TableRef) -> bool {
        self.write_tables().remove(table).is_some()
    }

    /// Insert a row in column order, replacing any row with the same key.
    pub fn insert(&self, table: &TableRef, row: Row) -> Result<()> {
        let mut tables = self.write_tables();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| missing_table(self.backend(), table))?;
        if row.len() != t.columns.len() {
            return Err(ReconcileError::query(
                self.backend(),
                format!(
                    "{}: row has {} values, table has {} columns",
                    table,
                    row.len(),
                    t.columns.len()
                ),
            ));
        }
        let key = RowKey(
            t.key_positions
                .iter()
                .map(|&i| row[i].to_key())
                .collect::<Result<Vec<_>>>()?,
        );
        t.rows.insert(key, row);
        Ok(())
    }

    /// Insert many rows.
    pub fn insert_all<I>(&self, table: &TableRef, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = Row>,
    {
        for row in rows {
            self.insert(table, row)?;
        }
        Ok(())
    }

    /// Set one column of an existing row.
    pub fn update(&self, table: &TableRef, key: &RowKey, column: &str, value: SqlValue) -> Result<bool> {
        let mut tables = self.write_tables();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| missing_table(self.backend(), table))?;
        let pos = t
            .position(column)
            .ok_or_else(|| missing_column(self.backend(), table, column))?;
        if t.key_positions.contains(&pos) {
            return Err(ReconcileError::query(
                self.backend(),
                format!("{}: cannot update key column {}", table, column),
            ));
        }
        match t.rows.get_mut(key) {
            Some(row) => {
                row[pos] = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete(&self, table: &TableRef, key: &RowKey) -> Result<bool> {
        let mut tables = self.write_tables();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| missing_table(self.backend(), table))?;
        Ok(t.rows.remove(key).is_some())
    }

    /// Physical row count, ignoring soft-delete markers.
    pub fn row_count(&self, table: &TableRef) -> usize {
        self.read_tables().get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Fail the next `times` calls at `fault` with errors made by `make`.
    pub fn inject<F>(&self, fault: Fault, times: usize, make: F)
    where
        F: Fn() -> ReconcileError + Send + Sync + 'static,
    {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert(
            fault,
            FaultPlan {
                remaining: times,
                make: Arc::new(make),
            },
        );
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Injected failures not yet consumed at `fault`.
    pub fn remaining_faults(&self, fault: Fault) -> usize {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&fault)
            .map(|p| p.remaining)
            .unwrap_or(0)
    }

    /// Delay applied to every read.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Make liveness checks hang, like a half-open socket.
    pub fn stall_pings(&self, stall: bool) {
        self.stall_pings.store(stall, Ordering::Relaxed);
    }

    /// Number of reads served so far.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn take_fault(&self, fault: Fault) -> Result<()> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(plan) = faults.get_mut(&fault) {
            if plan.remaining > 0 {
                plan.remaining -= 1;
                return Err((plan.make)());
            }
        }
        Ok(())
    }

    async fn before_read(&self) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.take_fault(Fault::Query)
    }

    /// Columns with a data type taken from the first non-NULL value.
    fn list_columns_sync(&self, table: &TableRef) -> Result<Vec<ColumnInfo>> {
        let tables = self.read_tables();
        let t = tables
            .get(table)
            .ok_or_else(|| missing_table(self.backend(), table))?;
        Ok(t.columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let data_type = t
                    .rows
                    .values()
                    .map(|row| &row[i])
                    .find(|v| !v.is_null())
                    .map_or("unknown", type_name);
                ColumnInfo::new(name.clone(), data_type)
            })
            .collect())
    }

    /// Visit rows matching `req` in key order with the requested projection.
    fn visit(&self, req: &ScanRequest, mut f: impl FnMut(Row) -> Result<bool>) -> Result<()> {
        let tables = self.read_tables();
        let t = tables
            .get(&req.table)
            .ok_or_else(|| missing_table(self.backend(), &req.table))?;

        let projection = req
            .projection()
            .map(|c| {
                t.position(c)
                    .ok_or_else(|| missing_column(self.backend(), &req.table, c))
            })
            .collect::<Result<Vec<_>>>()?;
        let window_pos = match &req.window {
            Some(w) => Some(
                t.position(&w.column)
                    .ok_or_else(|| missing_column(self.backend(), &req.table, &w.column))?,
            ),
            None => None,
        };
        let soft_delete_pos = match &req.soft_delete {
            Some(sd) => Some((
                t.position(&sd.column)
                    .ok_or_else(|| missing_column(self.backend(), &req.table, &sd.column))?,
                sd.style,
            )),
            None => None,
        };

        for (key, row) in &t.rows {
            if !req.range.contains(key) {
                continue;
            }
            if let (Some(window), Some(pos)) = (&req.window, window_pos) {
                // NULL never satisfies a comparison
                let in_window = match &row[pos] {
                    SqlValue::Null => false,
                    value => window.contains(&value.to_key()?),
                };
                if !in_window {
                    continue;
                }
            }
            if let Some((pos, style)) = soft_delete_pos {
                let deleted = match style {
                    SoftDeleteStyle::Flag => row[pos].is_truthy(),
                    SoftDeleteStyle::Timestamp => !row[pos].is_null(),
                };
                if deleted {
                    continue;
                }
            }
            let projected = projection.iter().map(|&i| row[i].clone()).collect();
            if !f(projected)? {
                break;
            }
        }
        Ok(())
    }

    fn max_value_sync(&self, table: &TableRef, column: &str) -> Result<Option<KeyValue>> {
        let tables = self.read_tables();
        let t = tables
            .get(table)
            .ok_or_else(|| missing_table(self.backend(), table))?;
        let pos = t
            .position(column)
            .ok_or_else(|| missing_column(self.backend(), table, column))?;
        let mut max: Option<KeyValue> = None;
        for row in t.rows.values() {
            if row[pos].is_null() {
                continue;
            }
            let value = row[pos].to_key()?;
            if max.as_ref().map_or(true, |m| value > *m) {
                max = Some(value);
            }
        }
        Ok(max)
    }
}

fn type_name(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Null => "unknown",
        SqlValue::Bool(_) => "boolean",
        SqlValue::I16(_) => "smallint",
        SqlValue::I32(_) => "integer",
        SqlValue::I64(_) => "bigint",
        SqlValue::F32(_) => "real",
        SqlValue::F64(_) => "double precision",
        SqlValue::Text(_) => "text",
        SqlValue::Bytes(_) => "bytea",
        SqlValue::Uuid(_) => "uuid",
        SqlValue::Decimal(_) => "numeric",
        SqlValue::DateTime(_) => "timestamp",
        SqlValue::DateTimeOffset(_) => "timestamptz",
        SqlValue::Date(_) => "date",
        SqlValue::Time(_) => "time",
    }
}

fn missing_table(backend: &str, table: &TableRef) -> ReconcileError {
    ReconcileError::query(backend, format!("relation {} does not exist", table))
}

fn missing_column(backend: &str, table: &TableRef, column: &str) -> ReconcileError {
    ReconcileError::query(backend, format!("column {} does not exist in {}", column, table))
}

/// Connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    broken: bool,
}

impl MemoryConnection {
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.poisons_connection() {
                self.broken = true;
            }
        }
        result
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn kind(&self) -> DialectKind {
        self.db.kind
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn ping(&mut self) -> Result<()> {
        if self.db.stall_pings.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        let result = self.db.take_fault(Fault::Ping);
        self.check(result)
    }

    async fn list_columns(&mut self, table: &TableRef) -> Result<Vec<ColumnInfo>> {
        let result = match self.db.before_read().await {
            Ok(()) => self.db.list_columns_sync(table),
            Err(e) => Err(e),
        };
        self.check(result)
    }

    async fn count(&mut self, req: &ScanRequest) -> Result<u64> {
        let result = match self.db.before_read().await {
            Ok(()) => {
                let mut n = 0u64;
                self.db
                    .visit(req, |_| {
                        n += 1;
                        Ok(true)
                    })
                    .map(|()| n)
            }
            Err(e) => Err(e),
        };
        self.check(result)
    }

    async fn scan(&mut self, req: &ScanRequest, sink: &mut RowSink<'_>) -> Result<u64> {
        let result = match self.db.before_read().await {
            Ok(()) => {
                let mut n = 0u64;
                self.db
                    .visit(req, |row| {
                        n += 1;
                        sink(row)?;
                        Ok(true)
                    })
                    .map(|()| n)
            }
            Err(e) => Err(e),
        };
        self.check(result)
    }

    async fn key_at(&mut self, req: &ScanRequest, offset: u64) -> Result<Option<RowKey>> {
        let result = match self.db.before_read().await {
            Ok(()) => {
                let keys = req.keys_only();
                let key_len = keys.key_columns.len();
                let mut seen = 0u64;
                let mut found = None;
                self.db
                    .visit(&keys, |row| {
                        if seen == offset {
                            found = Some(RowKey::from_row(&row, key_len)?);
                            return Ok(false);
                        }
                        seen += 1;
                        Ok(true)
                    })
                    .map(|()| found)
            }
            Err(e) => Err(e),
        };
        self.check(result)
    }

    async fn max_value(&mut self, table: &TableRef, column: &str) -> Result<Option<KeyValue>> {
        let result = match self.db.before_read().await {
            Ok(()) => self.db.max_value_sync(table, column),
            Err(e) => Err(e),
        };
        self.check(result)
    }
}

/// [`ConnectionManager`] handing out connections to one [`MemoryDatabase`].
pub struct MemoryManager {
    db: Arc<MemoryDatabase>,
    attempts: AtomicU64,
    connects: AtomicU64,
}

impl MemoryManager {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self {
            db,
            attempts: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    /// Successful connects.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Connect attempts, including failed ones.
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionManager for MemoryManager {
    fn kind(&self) -> DialectKind {
        self.db.kind
    }

    fn describe(&self) -> String {
        format!("memory ({})", self.db.kind)
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.db.take_fault(Fault::Connect)?;
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryConnection {
            db: self.db.clone(),
            broken: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SoftDelete, SoftDeleteStyle};
    use crate::dialect::{KeyRange, Window};

    fn users() -> TableRef {
        TableRef::new("dbo", "users")
    }

    fn seeded() -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new(DialectKind::Mssql));
        db.create_table(users(), &["id", "name", "deleted"], &["id"]).unwrap();
        for (id, name, deleted) in [(3, "c", false), (1, "a", false), (2, "b", true), (4, "d", false)] {
            db.insert(
                &users(),
                vec![SqlValue::I32(id), SqlValue::Text(name.into()), SqlValue::Bool(deleted)],
            )
            .unwrap();
        }
        db
    }

    fn req() -> ScanRequest {
        ScanRequest::new(users(), vec!["id".into()], vec!["name".into()])
    }

    async fn connect(db: &Arc<MemoryDatabase>) -> Box<dyn Connection> {
        MemoryManager::new(db.clone()).connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_scan_orders_by_key_and_projects() {
        let db = seeded();
        let mut conn = connect(&db).await;
        let mut rows = Vec::new();
        let n = conn
            .scan(&req(), &mut |row| {
                rows.push(row);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(rows[0], vec![SqlValue::I32(1), SqlValue::Text("a".into())]);
        assert_eq!(rows[3][0], SqlValue::I32(4));
    }

    #[tokio::test]
    async fn test_filters_range_window_and_soft_delete() {
        let db = seeded();
        let mut conn = connect(&db).await;

        let live = req().excluding_deleted(Some(SoftDelete {
            column: "deleted".into(),
            style: SoftDeleteStyle::Flag,
        }));
        assert_eq!(conn.count(&live).await.unwrap(), 3);

        let ranged = req().with_range(KeyRange::new(
            Some(RowKey::single(KeyValue::Int(1))),
            Some(RowKey::single(KeyValue::Int(3))),
        ));
        assert_eq!(conn.count(&ranged).await.unwrap(), 2);

        let windowed = req().with_window(Some(Window {
            column: "id".into(),
            after: Some(KeyValue::Int(2)),
            up_to: None,
        }));
        assert_eq!(conn.count(&windowed).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_key_at_and_max() {
        let db = seeded();
        let mut conn = connect(&db).await;
        assert_eq!(
            conn.key_at(&req(), 1).await.unwrap(),
            Some(RowKey::single(KeyValue::Int(2)))
        );
        assert_eq!(conn.key_at(&req(), 10).await.unwrap(), None);
        assert_eq!(
            conn.max_value(&users(), "id").await.unwrap(),
            Some(KeyValue::Int(4))
        );
    }

    #[tokio::test]
    async fn test_list_columns_reports_types() {
        let db = seeded();
        let mut conn = connect(&db).await;
        let columns = conn.list_columns(&users()).await.unwrap();
        assert_eq!(
            columns,
            vec![
                ColumnInfo::new("id", "integer"),
                ColumnInfo::new("name", "text"),
                ColumnInfo::new("deleted", "boolean"),
            ]
        );
        assert_eq!(columns[1].key_kind(), crate::core::KeyKind::Text);
    }

    #[tokio::test]
    async fn test_missing_table_is_query_error() {
        let db = seeded();
        let mut conn = connect(&db).await;
        let req = ScanRequest::new(TableRef::new("dbo", "nope"), vec!["id".into()], vec![]);
        let err = conn.count(&req).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Query { .. }));
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_injected_connectivity_fault_breaks_connection() {
        let db = seeded();
        let mut conn = connect(&db).await;
        db.inject(Fault::Query, 1, || ReconcileError::connectivity("mssql", "reset"));
        assert!(conn.count(&req()).await.is_err());
        assert!(conn.is_broken());
        assert_eq!(db.remaining_faults(Fault::Query), 0);
    }

    #[test]
    fn test_update_and_delete() {
        let db = seeded();
        let key = RowKey::single(KeyValue::Int(1));
        assert!(db.update(&users(), &key, "name", SqlValue::Text("z".into())).unwrap());
        assert!(db.update(&users(), &key, "id", SqlValue::I32(9)).is_err());
        assert!(db.delete(&users(), &key).unwrap());
        assert!(!db.delete(&users(), &key).unwrap());
        assert_eq!(db.row_count(&users()), 3);
    }
}
