//! SQL Server dialect.

use crate::core::identifier::quote_mssql;
use crate::core::{KeyKind, KeyValue, SoftDelete, SoftDeleteStyle, SqlValue, TableRef};
use crate::error::{ReconcileError, Result};

use super::Dialect;

/// Microsoft SQL Server dialect implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn quote_ident(&self, name: &str) -> Result<String> {
        quote_mssql(name)
    }

    fn placeholder(&self, index: usize, _value: &KeyValue) -> String {
        // Tiberius binds @P1, @P2, ... with the parameter's own TDS type
        format!("@P{}", index)
    }

    fn key_expr(&self, quoted: String, kind: KeyKind) -> String {
        match kind {
            KeyKind::Ordinal => quoted,
            KeyKind::Text => format!("{} COLLATE Latin1_General_BIN2", quoted),
            // uppercase hex text sorts like the canonical bytes
            KeyKind::Uuid => format!("CONVERT(CHAR(36), {}) COLLATE Latin1_General_BIN2", quoted),
        }
    }

    fn key_param(&self, value: &KeyValue, kind: KeyKind) -> KeyValue {
        match (kind, value) {
            (KeyKind::Uuid, KeyValue::Uuid(u)) => KeyValue::Text(u.to_string().to_uppercase()),
            _ => value.clone(),
        }
    }

    fn live_rows_predicate(&self, soft_delete: &SoftDelete) -> Result<String> {
        let col = self.quote_ident(&soft_delete.column)?;
        Ok(match soft_delete.style {
            SoftDeleteStyle::Flag => format!("({} IS NULL OR {} = 0)", col, col),
            SoftDeleteStyle::Timestamp => format!("{} IS NULL", col),
        })
    }

    fn deleted_flag(&self) -> &'static str {
        "1"
    }

    fn count_expr(&self) -> &'static str {
        "COUNT_BIG(*)"
    }

    fn paginate(&self, sql: &mut String, offset: u64, limit: u64) {
        sql.push_str(&format!(
            " OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            offset, limit
        ));
    }

    fn render_literal(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            // float has no NaN or infinity
            SqlValue::F32(v) if v.is_finite() => format!("{:e}", v),
            SqlValue::F64(v) if v.is_finite() => format!("{:e}", v),
            SqlValue::F32(_) | SqlValue::F64(_) => "NULL".to_string(),
            SqlValue::Text(s) => format!("N'{}'", s.replace('\'', "''")),
            SqlValue::Bytes(b) => format!("0x{}", hex::encode_upper(b)),
            SqlValue::Uuid(u) => format!("'{}'", u),
            SqlValue::Decimal(d) => d.to_string(),
            SqlValue::DateTime(dt) => format!(
                "CAST('{}' AS DATETIME2(7))",
                dt.format("%Y-%m-%dT%H:%M:%S%.f")
            ),
            SqlValue::DateTimeOffset(dt) => format!(
                "CAST('{}' AS DATETIMEOFFSET(7))",
                dt.format("%Y-%m-%dT%H:%M:%S%.f%:z")
            ),
            SqlValue::Date(d) => format!("CAST('{}' AS DATE)", d.format("%Y-%m-%d")),
            SqlValue::Time(t) => format!("CAST('{}' AS TIME(7))", t.format("%H:%M:%S%.f")),
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

        let source_cols = quoted
            .iter()
            .zip(values)
            .map(|(c, v)| format!("{} AS {}", self.render_literal(v), c))
            .collect::<Vec<_>>()
            .join(", ");

        let join_on = key_columns
            .iter()
            .map(|k| {
                let k = self.quote_ident(k)?;
                Ok(format!("tgt.{} = src.{}", k, k))
            })
            .collect::<Result<Vec<_>>>()?
            .join(" AND ");

        let non_key: Vec<&String> = columns
            .iter()
            .zip(quoted.iter())
            .filter(|(c, _)| !key_columns.contains(c))
            .map(|(_, q)| q)
            .collect();

        let mut sql = format!(
            "MERGE INTO {} AS tgt USING (SELECT {}) AS src ON {}",
            self.qualify(table)?,
            source_cols,
            join_on
        );

        if !non_key.is_empty() {
            let update_set = non_key
                .iter()
                .map(|c| format!("tgt.{} = src.{}", c, c))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", update_set));
        }

        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
            quoted.join(", "),
            quoted
                .iter()
                .map(|c| format!("src.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        ));

        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_quote_ident() {
        let dialect = MssqlDialect::new();
        assert_eq!(dialect.quote_ident("name").unwrap(), "[name]");
        assert_eq!(dialect.quote_ident("we]ird").unwrap(), "[we]]ird]");
    }

    #[test]
    fn test_placeholder_ignores_type() {
        let dialect = MssqlDialect::new();
        assert_eq!(dialect.placeholder(3, &KeyValue::Text("x".into())), "@P3");
    }

    #[test]
    fn test_text_and_uuid_keys_order_binary() {
        use crate::core::{RowKey, TableRef};
        use crate::dialect::{KeyRange, ScanRequest};
        use uuid::Uuid;

        let id = Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap();
        let bound = RowKey(vec![KeyValue::Text("Banana".into()), KeyValue::Uuid(id)]);
        let req = ScanRequest::new(
            TableRef::new("dbo", "fruit"),
            vec!["name".into(), "id".into()],
            vec![],
        )
        .with_key_kinds(vec![KeyKind::Text, KeyKind::Uuid])
        .with_range(KeyRange::new(Some(bound), None));

        let q = MssqlDialect.build_scan(&req).unwrap();
        assert_eq!(
            q.sql,
            "SELECT [name], [id] FROM [dbo].[fruit] WHERE \
             (([name] COLLATE Latin1_General_BIN2 > @P1) OR \
             ([name] COLLATE Latin1_General_BIN2 = @P2 AND \
             CONVERT(CHAR(36), [id]) COLLATE Latin1_General_BIN2 > @P3)) \
             ORDER BY [name] COLLATE Latin1_General_BIN2, \
             CONVERT(CHAR(36), [id]) COLLATE Latin1_General_BIN2"
        );
        assert_eq!(
            q.params[2],
            KeyValue::Text("6F9619FF-8B86-D011-B42D-00C04FC964FF".into())
        );
    }

    #[test]
    fn test_timestamp_soft_delete() {
        let pred = MssqlDialect
            .live_rows_predicate(&SoftDelete {
                column: "deleted_at".into(),
                style: SoftDeleteStyle::Timestamp,
            })
            .unwrap();
        assert_eq!(pred, "[deleted_at] IS NULL");
    }

    #[test]
    fn test_literals() {
        let d = MssqlDialect;
        assert_eq!(d.render_literal(&SqlValue::Null), "NULL");
        assert_eq!(d.render_literal(&SqlValue::Bool(true)), "1");
        assert_eq!(d.render_literal(&SqlValue::Text("it's".into())), "N'it''s'");
        assert_eq!(d.render_literal(&SqlValue::Bytes(vec![0xab, 0x01])), "0xAB01");
        assert_eq!(d.render_literal(&SqlValue::F64(f64::NAN)), "NULL");
        let dt = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_micro_opt(3, 4, 5, 600)
            .unwrap();
        assert_eq!(
            d.render_literal(&SqlValue::DateTime(dt)),
            "CAST('2024-01-02T03:04:05.000600' AS DATETIME2(7))"
        );
    }

    #[test]
    fn test_merge_upsert() {
        let cols = vec!["id".to_string(), "name".to_string()];
        let sql = MssqlDialect
            .build_upsert(
                &TableRef::new("dbo", "users"),
                &["id".to_string()],
                &cols,
                &[SqlValue::I32(7), SqlValue::Text("bob".into())],
            )
            .unwrap();
        assert_eq!(
            sql,
            "MERGE INTO [dbo].[users] AS tgt USING (SELECT 7 AS [id], N'bob' AS [name]) AS src \
             ON tgt.[id] = src.[id] WHEN MATCHED THEN UPDATE SET tgt.[name] = src.[name] \
             WHEN NOT MATCHED THEN INSERT ([id], [name]) VALUES (src.[id], src.[name]);"
        );
    }

    #[test]
    fn test_merge_key_only_table() {
        let cols = vec!["id".to_string()];
        let sql = MssqlDialect
            .build_upsert(&TableRef::new("dbo", "tags"), &cols, &cols, &[SqlValue::I64(1)])
            .unwrap();
        assert!(!sql.contains("WHEN MATCHED"));
        assert!(sql.ends_with("WHEN NOT MATCHED THEN INSERT ([id]) VALUES (src.[id]);"));
    }

    #[test]
    fn test_upsert_arity_mismatch() {
        let cols = vec!["id".to_string(), "name".to_string()];
        let result = MssqlDialect.build_upsert(
            &TableRef::new("dbo", "users"),
            &["id".to_string()],
            &cols,
            &[SqlValue::I32(7)],
        );
        assert!(result.is_err());
    }
}
