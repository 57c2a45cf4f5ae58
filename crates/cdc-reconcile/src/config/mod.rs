//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill type-dependent endpoint defaults (ports, schemas).
    pub fn apply_defaults(&mut self) {
        self.source.apply_defaults();
        self.target.apply_defaults();
        if let Some(conn) = self.checkpoint.connection.as_mut() {
            conn.apply_defaults();
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration, recorded in run reports.
    ///
    /// Passwords are never serialized, so they do not contribute.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Key signing file checkpoints.
    ///
    /// Taken from `checkpoint.hmac_key_env` when set, otherwise derived from
    /// the source and target locations so that tuning changes keep existing
    /// checkpoints valid while pointing the file store at another pair of
    /// databases does not.
    pub fn checkpoint_key(&self) -> Vec<u8> {
        if let Some(var) = &self.checkpoint.hmac_key_env {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    return key.into_bytes();
                }
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(self.source.r#type.as_str().as_bytes());
        hasher.update(self.source.location().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.target.r#type.as_str().as_bytes());
        hasher.update(self.target.location().as_bytes());
        hasher.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DialectKind;
    use crate::reconciler::ReconcileMode;

    const YAML: &str = r#"
source:
  type: mssql
  host: sql1
  database: sales
  user: sa
  password_env: SALES_PW
target:
  type: postgres
  host: pg1
  database: sales_replica
  user: replicator
  password: hunter2
  ssl_mode: require
tables:
  - schema: dbo
    name: orders
    primary_key: [id]
    soft_delete:
      column: is_deleted
  - name: order_lines
    primary_key: [order_id, line_no]
    watermark_column: updated_at
reconcile:
  workers: 6
  chunk_size: 10000
checkpoint:
  store: memory
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.r#type, DialectKind::Mssql);
        assert_eq!(config.source.port, 1433);
        assert_eq!(config.source.schema, "dbo");
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.target.schema, "public");
        assert_eq!(config.tables.len(), 2);
        assert_eq!(config.reconcile.mode, ReconcileMode::Full);
        assert_eq!(config.reconcile.get_workers(), 6);
        assert!(config.reconcile.validate_checksum);
        assert_eq!(config.checkpoint.store, CheckpointStoreKind::Memory);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = Config::from_yaml(YAML).unwrap();
        let debug = format!("{:?}", config.target);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_hash_ignores_password() {
        let a = Config::from_yaml(YAML).unwrap();
        let b = Config::from_yaml(&YAML.replace("hunter2", "other")).unwrap();
        assert_eq!(a.hash(), b.hash());

        let c = Config::from_yaml(&YAML.replace("workers: 6", "workers: 7")).unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_checkpoint_key_survives_tuning_changes() {
        let a = Config::from_yaml(YAML).unwrap();
        let b = Config::from_yaml(&YAML.replace("workers: 6", "workers: 7")).unwrap();
        assert_eq!(a.checkpoint_key(), b.checkpoint_key());

        let c = Config::from_yaml(&YAML.replace("host: pg1", "host: pg2")).unwrap();
        assert_ne!(a.checkpoint_key(), c.checkpoint_key());
    }

    #[test]
    fn test_auto_tuning_respects_explicit_values() {
        let resources = SystemResources {
            total_memory_gb: 32.0,
            cpu_cores: 16,
        };
        let tuned = ReconcileConfig::default().with_auto_tuning(&resources);
        assert_eq!(tuned.get_workers(), 14);
        assert_eq!(tuned.get_chunk_size(), 150_000);

        let explicit = ReconcileConfig {
            workers: Some(3),
            ..ReconcileConfig::default()
        }
        .with_auto_tuning(&resources);
        assert_eq!(explicit.get_workers(), 3);
    }

    #[test]
    fn test_pool_size_follows_workers() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.reconcile.pool_size_for(&config.source), 8);

        let mut small = config.reconcile.clone();
        small.workers = Some(1);
        assert_eq!(small.pool_size_for(&config.source), 4);
    }
}
