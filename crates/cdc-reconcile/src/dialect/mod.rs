//! SQL dialects (Strategy pattern).
//!
//! A [`Dialect`] turns a [`ScanRequest`] into backend SQL and renders repair
//! statements. Implementations supply the primitives that differ between
//! backends (identifier quoting, placeholders, soft-delete predicates,
//! pagination, literals, upserts); the query skeletons are default methods.

mod mssql;
mod postgres;
pub mod query;

pub use mssql::MssqlDialect;
pub use postgres::PostgresDialect;
pub use query::{KeyRange, RenderedQuery, ScanRequest, Window};

use serde::{Deserialize, Serialize};

use crate::core::{KeyKind, KeyValue, RowKey, SoftDelete, SoftDeleteStyle, SqlValue, TableRef};
use crate::error::Result;

/// Backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectKind {
    Mssql,
    Postgres,
}

static MSSQL: MssqlDialect = MssqlDialect;
static POSTGRES: PostgresDialect = PostgresDialect;

impl DialectKind {
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            DialectKind::Mssql => &MSSQL,
            DialectKind::Postgres => &POSTGRES,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DialectKind::Mssql => "mssql",
            DialectKind::Postgres => "postgres",
        }
    }
}

impl std::fmt::Display for DialectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQL syntax strategy for one backend.
pub trait Dialect: Send + Sync {
    /// Dialect name (e.g. "mssql", "postgres").
    fn name(&self) -> &'static str;

    /// Validate and quote an identifier.
    fn quote_ident(&self, name: &str) -> Result<String>;

    /// Placeholder for the 1-based parameter `index` bound to `value`.
    fn placeholder(&self, index: usize, value: &KeyValue) -> String;

    /// Predicate keeping only rows whose soft-delete marker is not set.
    fn live_rows_predicate(&self, soft_delete: &SoftDelete) -> Result<String>;

    /// Expression a quoted key column is ordered and compared by.
    fn key_expr(&self, quoted: String, _kind: KeyKind) -> String {
        quoted
    }

    /// Bound value compared against [`key_expr`](Self::key_expr).
    fn key_param(&self, value: &KeyValue, _kind: KeyKind) -> KeyValue {
        value.clone()
    }

    /// Literal that sets a soft-delete flag column.
    fn deleted_flag(&self) -> &'static str;

    /// Aggregate used for row counts.
    fn count_expr(&self) -> &'static str;

    /// Append `OFFSET`/`LIMIT` to an ordered query.
    fn paginate(&self, sql: &mut String, offset: u64, limit: u64);

    /// Render a value as an SQL literal for repair scripts.
    fn render_literal(&self, value: &SqlValue) -> String;

    /// Idempotent insert-or-update of one row.
    fn build_upsert(
        &self,
        table: &TableRef,
        key_columns: &[String],
        columns: &[String],
        values: &[SqlValue],
    ) -> Result<String>;

    /// `schema.table` with quoting.
    fn qualify(&self, table: &TableRef) -> Result<String> {
        Ok(format!(
            "{}.{}",
            self.quote_ident(&table.schema)?,
            self.quote_ident(&table.name)?
        ))
    }

    /// Lexicographic key comparison against `bound`.
    ///
    /// Lower bounds are exclusive (`key > bound`), upper bounds inclusive
    /// (`key <= bound`). Composite keys expand to
    /// `(a > x) OR (a = x AND b > y)`.
    fn keyset_predicate(
        &self,
        key_columns: &[String],
        kinds: &[KeyKind],
        bound: &RowKey,
        lower: bool,
        params: &mut Vec<KeyValue>,
    ) -> Result<String> {
        let n = key_columns.len().min(bound.len());
        let mut exprs = Vec::with_capacity(n);
        let mut values = Vec::with_capacity(n);
        for (i, column) in key_columns.iter().take(n).enumerate() {
            let kind = kinds.get(i).copied().unwrap_or_default();
            exprs.push(self.key_expr(self.quote_ident(column)?, kind));
            values.push(self.key_param(&bound.0[i], kind));
        }

        let mut disjuncts = Vec::with_capacity(n);
        for i in 0..n {
            let mut terms = Vec::with_capacity(i + 1);
            for j in 0..i {
                params.push(values[j].clone());
                terms.push(format!(
                    "{} = {}",
                    exprs[j],
                    self.placeholder(params.len(), &values[j])
                ));
            }
            let op = match (lower, i + 1 == n) {
                (true, _) => ">",
                (false, true) => "<=",
                (false, false) => "<",
            };
            params.push(values[i].clone());
            terms.push(format!(
                "{} {} {}",
                exprs[i],
                op,
                self.placeholder(params.len(), &values[i])
            ));
            disjuncts.push(terms.join(" AND "));
        }

        if disjuncts.len() == 1 {
            return Ok(disjuncts.remove(0));
        }
        Ok(disjuncts
            .iter()
            .map(|d| format!("({})", d))
            .collect::<Vec<_>>()
            .join(" OR "))
    }

    /// WHERE clause (including the keyword) for a request, or empty.
    fn where_clause(&self, req: &ScanRequest, params: &mut Vec<KeyValue>) -> Result<String> {
        let mut conditions = Vec::new();

        if let Some(lower) = &req.range.lower {
            let pred = self.keyset_predicate(&req.key_columns, &req.key_kinds, lower, true, params)?;
            conditions.push(format!("({})", pred));
        }
        if let Some(upper) = &req.range.upper {
            let pred = self.keyset_predicate(&req.key_columns, &req.key_kinds, upper, false, params)?;
            conditions.push(format!("({})", pred));
        }
        if let Some(window) = &req.window {
            let col = self.quote_ident(&window.column)?;
            if let Some(after) = &window.after {
                params.push(after.clone());
                conditions.push(format!("{} > {}", col, self.placeholder(params.len(), after)));
            }
            if let Some(up_to) = &window.up_to {
                params.push(up_to.clone());
                conditions.push(format!("{} <= {}", col, self.placeholder(params.len(), up_to)));
            }
        }
        if let Some(sd) = &req.soft_delete {
            conditions.push(self.live_rows_predicate(sd)?);
        }

        if conditions.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!(" WHERE {}", conditions.join(" AND ")))
        }
    }

    /// ORDER BY clause over the key columns.
    fn order_by_key(&self, req: &ScanRequest) -> Result<String> {
        let cols = req
            .key_columns
            .iter()
            .enumerate()
            .map(|(i, c)| Ok(self.key_expr(self.quote_ident(c)?, req.key_kind(i))))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(" ORDER BY {}", cols.join(", ")))
    }

    /// Row count of the requested range.
    fn build_count(&self, req: &ScanRequest) -> Result<RenderedQuery> {
        let mut params = Vec::new();
        let sql = format!(
            "SELECT {} FROM {}{}",
            self.count_expr(),
            self.qualify(&req.table)?,
            self.where_clause(req, &mut params)?
        );
        Ok(RenderedQuery::new(sql, params))
    }

    /// Rows of the requested range, key first, ordered by key.
    fn build_scan(&self, req: &ScanRequest) -> Result<RenderedQuery> {
        let mut params = Vec::new();
        let cols = req
            .projection()
            .map(|c| self.quote_ident(c))
            .collect::<Result<Vec<_>>>()?;
        let sql = format!(
            "SELECT {} FROM {}{}{}",
            cols.join(", "),
            self.qualify(&req.table)?,
            self.where_clause(req, &mut params)?,
            self.order_by_key(req)?
        );
        Ok(RenderedQuery::new(sql, params))
    }

    /// Key of the row at zero-based `offset` within the range, in key order.
    fn build_key_at(&self, req: &ScanRequest, offset: u64) -> Result<RenderedQuery> {
        let keys = req.keys_only();
        let mut query = self.build_scan(&keys)?;
        self.paginate(&mut query.sql, offset, 1);
        Ok(query)
    }

    /// Maximum value of `column` (watermark high mark).
    fn build_max(&self, table: &TableRef, column: &str) -> Result<RenderedQuery> {
        let sql = format!(
            "SELECT MAX({}) FROM {}",
            self.quote_ident(column)?,
            self.qualify(table)?
        );
        Ok(RenderedQuery::new(sql, Vec::new()))
    }

    /// Column names and data types of a table in ordinal order.
    fn build_list_columns(&self, table: &TableRef) -> RenderedQuery {
        let schema = KeyValue::Text(table.schema.clone());
        let name = KeyValue::Text(table.name.clone());
        let sql = format!(
            "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} ORDER BY ORDINAL_POSITION",
            self.placeholder(1, &schema),
            self.placeholder(2, &name)
        );
        RenderedQuery::new(sql, vec![schema, name])
    }

    /// `col = literal AND ...` matching one key.
    fn key_condition(&self, key_columns: &[String], key: &RowKey) -> Result<String> {
        let mut terms = Vec::with_capacity(key_columns.len());
        for (col, value) in key_columns.iter().zip(key.values()) {
            terms.push(format!(
                "{} = {}",
                self.quote_ident(col)?,
                self.render_literal(&SqlValue::from(value.clone()))
            ));
        }
        Ok(terms.join(" AND "))
    }

    /// Delete one row by key.
    fn build_delete(&self, table: &TableRef, key_columns: &[String], key: &RowKey) -> Result<String> {
        Ok(format!(
            "DELETE FROM {} WHERE {};",
            self.qualify(table)?,
            self.key_condition(key_columns, key)?
        ))
    }

    /// Set the soft-delete marker of one row. A timestamp marker keeps the
    /// time of its first deletion.
    fn build_mark_deleted(
        &self,
        table: &TableRef,
        key_columns: &[String],
        key: &RowKey,
        soft_delete: &SoftDelete,
    ) -> Result<String> {
        let col = self.quote_ident(&soft_delete.column)?;
        let condition = self.key_condition(key_columns, key)?;
        Ok(match soft_delete.style {
            SoftDeleteStyle::Flag => format!(
                "UPDATE {} SET {} = {} WHERE {};",
                self.qualify(table)?,
                col,
                self.deleted_flag(),
                condition
            ),
            SoftDeleteStyle::Timestamp => format!(
                "UPDATE {} SET {} = CURRENT_TIMESTAMP WHERE {} AND {} IS NULL;",
                self.qualify(table)?,
                col,
                condition,
                col
            ),
        })
    }
}
