//! Configuration validation.

use std::collections::HashSet;

use super::{CheckpointStoreKind, Config, EndpointConfig};
use crate::core::identifier::validate_identifier;
use crate::dialect::DialectKind;
use crate::error::{ReconcileError, Result};
use crate::reconciler::ReconcileMode;

fn validate_endpoint(side: &str, endpoint: &EndpointConfig) -> Result<()> {
    if endpoint.host.is_empty() {
        return Err(ReconcileError::Config(format!("{}.host is required", side)));
    }
    if endpoint.database.is_empty() {
        return Err(ReconcileError::Config(format!("{}.database is required", side)));
    }
    if endpoint.user.is_empty() {
        return Err(ReconcileError::Config(format!("{}.user is required", side)));
    }
    if endpoint.password.is_some() && endpoint.password_env.is_some() {
        return Err(ReconcileError::Config(format!(
            "{}: set either password or password_env, not both",
            side
        )));
    }
    if !endpoint.schema.is_empty() {
        validate_identifier(&endpoint.schema)?;
    }
    if endpoint.max_connections == Some(0) {
        return Err(ReconcileError::Config(format!(
            "{}.max_connections must be at least 1",
            side
        )));
    }
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_endpoint("source", &config.source)?;
    validate_endpoint("target", &config.target)?;

    // Cannot reconcile a database against itself
    if config.source.host == config.target.host
        && config.source.port == config.target.port
        && config.source.database == config.target.database
    {
        return Err(ReconcileError::Config(
            "source and target cannot be the same database".into(),
        ));
    }

    let mut seen = HashSet::new();
    for table in &config.tables {
        table.validate()?;
        let id = table
            .source_ref(&config.source.schema)
            .to_string()
            .to_lowercase();
        if !seen.insert(id) {
            return Err(ReconcileError::Config(format!(
                "table {} is listed more than once",
                table.qualified_name()
            )));
        }
        if config.reconcile.mode == ReconcileMode::Incremental {
            table.effective_watermark()?;
        }
    }

    let reconcile = &config.reconcile;
    if let Some(0) = reconcile.workers {
        return Err(ReconcileError::Config(
            "reconcile.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = reconcile.chunk_size {
        return Err(ReconcileError::Config(
            "reconcile.chunk_size must be at least 1".into(),
        ));
    }
    if reconcile.leaf_size == 0 {
        return Err(ReconcileError::Config(
            "reconcile.leaf_size must be at least 1".into(),
        ));
    }
    if reconcile.retry.max_attempts == 0 {
        return Err(ReconcileError::Config(
            "reconcile.retry.max_attempts must be at least 1".into(),
        ));
    }
    if reconcile.query_timeout_secs == 0 || reconcile.acquire_timeout_secs == 0 {
        return Err(ReconcileError::Config(
            "reconcile query and acquire timeouts must be at least 1 second".into(),
        ));
    }

    // Each worker holds one connection per side; a smaller pool self-deadlocks
    if let Some(workers) = reconcile.workers {
        for (side, endpoint) in [("source", &config.source), ("target", &config.target)] {
            if let Some(max) = endpoint.max_connections {
                if max < workers {
                    return Err(ReconcileError::Config(format!(
                        "{}.max_connections ({}) must be at least reconcile.workers ({})",
                        side, max, workers
                    )));
                }
            }
        }
    }

    let checkpoint = &config.checkpoint;
    if checkpoint.store == CheckpointStoreKind::Postgres {
        match &checkpoint.connection {
            Some(conn) => {
                validate_endpoint("checkpoint.connection", conn)?;
                if conn.r#type != DialectKind::Postgres {
                    return Err(ReconcileError::Config(
                        "checkpoint.connection must be a postgres database".into(),
                    ));
                }
            }
            None if config.target.r#type == DialectKind::Postgres => {}
            None => {
                return Err(ReconcileError::Config(
                    "checkpoint.store=postgres needs checkpoint.connection when the target is not postgres"
                        .into(),
                ))
            }
        }
        validate_identifier(&checkpoint.schema)?;
    }
    if checkpoint.store == CheckpointStoreKind::File && checkpoint.path.as_os_str().is_empty() {
        return Err(ReconcileError::Config("checkpoint.path is required".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckpointConfig, ReconcileConfig};
    use crate::core::TableSpec;

    fn endpoint(kind: DialectKind, host: &str) -> EndpointConfig {
        let mut e: EndpointConfig = serde_yaml::from_str(&format!(
            "type: {}\nhost: {}\ndatabase: app\nuser: u\n",
            kind, host
        ))
        .unwrap();
        e.apply_defaults();
        e
    }

    fn valid_config() -> Config {
        Config {
            source: endpoint(DialectKind::Mssql, "src"),
            target: endpoint(DialectKind::Postgres, "dst"),
            tables: vec![TableSpec::new("dbo", "orders", &["id"])],
            reconcile: ReconcileConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = String::new();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("source.host"));
    }

    #[test]
    fn test_same_database_rejected() {
        let mut config = valid_config();
        config.target.host = "src".into();
        config.target.port = 1433;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut config = valid_config();
        config.tables.push(TableSpec::new("DBO", "Orders", &["id"]));
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_pool_smaller_than_workers_rejected() {
        let mut config = valid_config();
        config.reconcile.workers = Some(8);
        config.target.max_connections = Some(4);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("target.max_connections"));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let mut config = valid_config();
        config.reconcile.chunk_size = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_incremental_needs_watermark() {
        let mut config = valid_config();
        config.reconcile.mode = ReconcileMode::Incremental;
        config
            .tables
            .push(TableSpec::new("dbo", "lines", &["order_id", "line_no"]));
        assert!(validate(&config).is_err());

        config.tables[1].watermark_column = Some("updated_at".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_postgres_store_needs_postgres_database() {
        let mut config = valid_config();
        config.checkpoint.store = CheckpointStoreKind::Postgres;
        assert!(validate(&config).is_ok());

        config.target = endpoint(DialectKind::Mssql, "dst");
        assert!(validate(&config).is_err());

        config.checkpoint.connection = Some(endpoint(DialectKind::Postgres, "state"));
        assert!(validate(&config).is_ok());
    }
}
