//! PostgreSQL dialect.

use crate::core::identifier::quote_pg;
use crate::core::{KeyKind, KeyValue, SoftDelete, SoftDeleteStyle, SqlValue, TableRef};
use crate::error::{ReconcileError, Result};

use super::Dialect;

/// PostgreSQL dialect implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }

    /// Type a bound parameter is cast to, so comparisons against narrower
    /// column types resolve through the cross-type operators.
    fn param_type(value: &KeyValue) -> &'static str {
        match value {
            KeyValue::Int(_) => "bigint",
            KeyValue::Decimal(_) => "numeric",
            KeyValue::Text(_) => "text",
            KeyValue::Uuid(_) => "uuid",
            KeyValue::DateTime(_) => "timestamp",
            KeyValue::Date(_) => "date",
            KeyValue::Time(_) => "time",
            KeyValue::Bytes(_) => "bytea",
        }
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_ident(&self, name: &str) -> Result<String> {
        quote_pg(name)
    }

    fn placeholder(&self, index: usize, value: &KeyValue) -> String {
        format!("${}::{}", index, Self::param_type(value))
    }

    fn key_expr(&self, quoted: String, kind: KeyKind) -> String {
        match kind {
            KeyKind::Text => format!("{} COLLATE \"C\"", quoted),
            // uuid already compares bytewise
            KeyKind::Ordinal | KeyKind::Uuid => quoted,
        }
    }

    fn live_rows_predicate(&self, soft_delete: &SoftDelete) -> Result<String> {
        let col = self.quote_ident(&soft_delete.column)?;
        Ok(match soft_delete.style {
            // boolean and smallint flags both cast to int
            SoftDeleteStyle::Flag => format!("({} IS NULL OR {}::int = 0)", col, col),
            SoftDeleteStyle::Timestamp => format!("{} IS NULL", col),
        })
    }

    fn deleted_flag(&self) -> &'static str {
        // untyped, so it coerces to boolean and integer flags alike
        "'1'"
    }

    fn count_expr(&self) -> &'static str {
        "COUNT(*)"
    }

    fn paginate(&self, sql: &mut String, offset: u64, limit: u64) {
        sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));
    }

    fn render_literal(&self, value: &SqlValue) -> String {
        fn float(v: f64) -> String {
            if v.is_nan() {
                "'NaN'::float8".to_string()
            } else if v.is_infinite() {
                if v > 0.0 {
                    "'Infinity'::float8".to_string()
                } else {
                    "'-Infinity'::float8".to_string()
                }
            } else {
                format!("{:e}", v)
            }
        }

        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => float(f64::from(*v)),
            SqlValue::F64(v) => float(*v),
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Bytes(b) => format!("'\\x{}'::bytea", hex::encode(b)),
            SqlValue::Uuid(u) => format!("'{}'::uuid", u),
            SqlValue::Decimal(d) => d.to_string(),
            SqlValue::DateTime(dt) => {
                format!("'{}'::timestamp", dt.format("%Y-%m-%d %H:%M:%S%.f"))
            }
            SqlValue::DateTimeOffset(dt) => {
                format!("'{}'::timestamptz", dt.format("%Y-%m-%d %H:%M:%S%.f%:z"))
            }
            SqlValue::Date(d) => format!("'{}'::date", d.format("%Y-%m-%d")),
            SqlValue::Time(t) => format!("'{}'::time", t.format("%H:%M:%S%.f")),
        }
    }

    fn build_upsert(
        &self,
        table: &TableRef,
        key_columns: &[String],
        columns: &[String],
        values: &[SqlValue],
    ) -> Result<String> {
        if columns.len() != values.len() {
            return Err(ReconcileError::query(
                self.name(),
                format!("upsert has {} columns but {} values", columns.len(), values.len()),
            ));
        }

        let quoted = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Result<Vec<_>>>()?;
        let literals = values
            .iter()
            .map(|v| self.render_literal(v))
            .collect::<Vec<_>>();
        let conflict_cols = key_columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Result<Vec<_>>>()?;

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO",
            self.qualify(table)?,
            quoted.join(", "),
            literals.join(", "),
            conflict_cols.join(", ")
        );

        let update_set = columns
            .iter()
            .zip(quoted.iter())
            .filter(|(c, _)| !key_columns.contains(c))
            .map(|(_, q)| format!("{} = EXCLUDED.{}", q, q))
            .collect::<Vec<_>>();

        if update_set.is_empty() {
            sql.push_str(" NOTHING;");
        } else {
            sql.push_str(&format!(" UPDATE SET {};", update_set.join(", ")));
        }

        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_text_keys_use_c_collation() {
        use crate::core::RowKey;
        use crate::dialect::{KeyRange, ScanRequest};

        let req = ScanRequest::new(
            TableRef::new("public", "fruit"),
            vec!["name".into(), "id".into()],
            vec![],
        )
        .with_key_kinds(vec![KeyKind::Text, KeyKind::Uuid])
        .with_range(KeyRange::new(
            None,
            Some(RowKey(vec![KeyValue::Text("apple".into()), KeyValue::Uuid(Uuid::nil())])),
        ));

        let q = PostgresDialect.build_scan(&req).unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"name\", \"id\" FROM \"public\".\"fruit\" WHERE \
             ((\"name\" COLLATE \"C\" < $1::text) OR \
             (\"name\" COLLATE \"C\" = $2::text AND \"id\" <= $3::uuid)) \
             ORDER BY \"name\" COLLATE \"C\", \"id\""
        );
    }

    #[test]
    fn test_quote_ident() {
        let dialect = PostgresDialect::new();
        assert_eq!(dialect.quote_ident("name").unwrap(), "\"name\"");
        assert_eq!(dialect.quote_ident("we\"ird").unwrap(), "\"we\"\"ird\"");
    }

    #[test]
    fn test_typed_placeholders() {
        let d = PostgresDialect;
        assert_eq!(d.placeholder(1, &KeyValue::Int(5)), "$1::bigint");
        assert_eq!(d.placeholder(2, &KeyValue::Uuid(Uuid::nil())), "$2::uuid");
        assert_eq!(d.placeholder(3, &KeyValue::Text("a".into())), "$3::text");
    }

    #[test]
    fn test_literals() {
        let d = PostgresDialect;
        assert_eq!(d.render_literal(&SqlValue::Bool(false)), "false");
        assert_eq!(d.render_literal(&SqlValue::Text("it's".into())), "'it''s'");
        assert_eq!(d.render_literal(&SqlValue::Bytes(vec![0xab])), "'\\xab'::bytea");
        assert_eq!(d.render_literal(&SqlValue::F64(f64::NAN)), "'NaN'::float8");
        assert_eq!(
            d.render_literal(&SqlValue::Uuid(Uuid::nil())),
            "'00000000-0000-0000-0000-000000000000'::uuid"
        );
    }

    #[test]
    fn test_upsert_on_conflict() {
        let cols = vec!["id".to_string(), "name".to_string()];
        let sql = PostgresDialect
            .build_upsert(
                &TableRef::new("public", "users"),
                &["id".to_string()],
                &cols,
                &[SqlValue::I32(7), SqlValue::Text("bob".into())],
            )
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") VALUES (7, 'bob') \
             ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\";"
        );
    }

    #[test]
    fn test_upsert_key_only_does_nothing() {
        let cols = vec!["id".to_string()];
        let sql = PostgresDialect
            .build_upsert(&TableRef::new("public", "tags"), &cols, &cols, &[SqlValue::I64(1)])
            .unwrap();
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING;"));
    }
}
