//! Checkpoint persistence backends.
//!
//! The [`CheckpointStore`] trait is the seam between the tracker and the
//! storage holding checkpoints:
//!
//! - **File**: [`FileCheckpointStore`], one HMAC-signed JSON file per table
//! - **PostgreSQL**: [`PgCheckpointStore`](super::postgres::PgCheckpointStore)
//! - **Memory**: [`MemoryCheckpointStore`], for tests and dry runs
//!
//! Every `save` replaces the stored checkpoint atomically: a failed or
//! interrupted save leaves the previous checkpoint readable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{Checkpoint, PgCheckpointStore};
use crate::config::{CheckpointStoreKind, Config};
use crate::error::{ReconcileError, Result};
use crate::observe::CredentialProvider;

type HmacSha256 = Hmac<Sha256>;

/// Storage for per-table checkpoints.
///
/// Implementations must be `Send + Sync`; the tracker shares one store
/// across all jobs and serializes writes per table itself.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Prepare the storage (directories, schema). Idempotent.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Checkpoint of `table`, if one was saved.
    async fn load(&self, table: &str) -> Result<Option<Checkpoint>>;

    /// Replace the checkpoint of `checkpoint.table` in one atomic step.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// All stored checkpoints ordered by table.
    async fn list(&self) -> Result<Vec<Checkpoint>>;

    /// Delete the checkpoint of `table`. Returns whether one existed.
    async fn remove(&self, table: &str) -> Result<bool>;

    /// Backend name for logs.
    fn store_type(&self) -> &'static str;
}

/// Signed on-disk form of a checkpoint.
#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    checkpoint: Checkpoint,
    hmac: String,
}

/// One JSON file per table under a directory.
///
/// Each file carries an HMAC-SHA256 over the serialized checkpoint, so a
/// hand-edited or truncated file is rejected instead of silently moving
/// the watermark. Writes go to a temporary file that is renamed over the
/// previous one.
pub struct FileCheckpointStore {
    dir: PathBuf,
    key: Vec<u8>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, key: Vec<u8>) -> Self {
        Self {
            dir: dir.into(),
            key,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the checkpoint of `table`.
    ///
    /// The readable part is sanitized; the hash suffix keeps distinct
    /// table names from colliding after sanitizing.
    pub fn path_for(&self, table: &str) -> PathBuf {
        let readable: String = table
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = Sha256::digest(table.as_bytes());
        self.dir
            .join(format!("{}-{}.json", readable, hex::encode(&digest[..4])))
    }

    fn sign(&self, checkpoint: &Checkpoint) -> Result<String> {
        let content = serde_json::to_string(checkpoint)?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ReconcileError::Checkpoint(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, file: &CheckpointFile, path: &Path) -> Result<()> {
        let content = serde_json::to_string(&file.checkpoint)?;
        let expected = hex::decode(&file.hmac).map_err(|_| {
            ReconcileError::Checkpoint(format!("{}: malformed signature", path.display()))
        })?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ReconcileError::Checkpoint(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        mac.verify_slice(&expected).map_err(|_| {
            ReconcileError::Checkpoint(format!(
                "{}: integrity check failed: HMAC mismatch (possible tampering)",
                path.display()
            ))
        })
    }

    async fn read_file(&self, path: &Path) -> Result<Checkpoint> {
        let content = tokio::fs::read_to_string(path).await?;
        let file: CheckpointFile = serde_json::from_str(&content).map_err(|e| {
            ReconcileError::Checkpoint(format!("{}: unreadable checkpoint: {}", path.display(), e))
        })?;
        self.verify(&file, path)?;
        Ok(file.checkpoint)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn load(&self, table: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(table);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let checkpoint = self.read_file(&path).await?;
        if checkpoint.table != table {
            return Err(ReconcileError::Checkpoint(format!(
                "{}: holds checkpoint of {}, expected {}",
                path.display(),
                checkpoint.table,
                table
            )));
        }
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let file = CheckpointFile {
            hmac: self.sign(checkpoint)?,
            checkpoint: checkpoint.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        // Atomic write: flush a temp file to disk, then rename over the old one
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.table);
        let temp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &path).await?;
        #[cfg(unix)]
        tokio::fs::File::open(&self.dir).await?.sync_all().await?;
        debug!("{}: checkpoint written to {}", checkpoint.table, path.display());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_file(&path).await {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        checkpoints.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(checkpoints)
    }

    async fn remove(&self, table: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(table)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn store_type(&self) -> &'static str {
        "file"
    }
}

/// Checkpoints held in process memory.
///
/// Saves can be made to fail to exercise checkpoint-write error handling.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<BTreeMap<String, Checkpoint>>,
    failing_saves: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` saves.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Checkpoint>> {
        self.checkpoints.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, table: &str) -> Result<Option<Checkpoint>> {
        Ok(self.map().get(table).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ReconcileError::Checkpoint("injected save failure".into()));
        }
        self.map().insert(checkpoint.table.clone(), checkpoint.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.map().values().cloned().collect())
    }

    async fn remove(&self, table: &str) -> Result<bool> {
        Ok(self.map().remove(table).is_some())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}

/// Open and initialize the store selected by `config.checkpoint`.
///
/// The PostgreSQL store uses `checkpoint.connection`, falling back to the
/// target database.
pub async fn open_store(config: &Config, credentials: &dyn CredentialProvider) -> Result<Arc<dyn CheckpointStore>> {
    let settings = &config.checkpoint;
    let store: Arc<dyn CheckpointStore> = match settings.store {
        CheckpointStoreKind::File => Arc::new(FileCheckpointStore::new(settings.path.clone(), config.checkpoint_key())),
        CheckpointStoreKind::Memory => Arc::new(MemoryCheckpointStore::new()),
        CheckpointStoreKind::Postgres => {
            let endpoint = settings.connection.as_ref().unwrap_or(&config.target);
            let creds = credentials.credentials(endpoint).await?;
            Arc::new(PgCheckpointStore::connect(endpoint, creds, &settings.schema)?)
        }
    };
    store.init().await?;
    debug!("Opened {} checkpoint store", store.store_type());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::TableDigest;
    use crate::core::{KeyValue, SqlValue};

    fn checkpoint(table: &str, watermark: i64) -> Checkpoint {
        let row = [SqlValue::I64(watermark), SqlValue::Text("x".into())];
        Checkpoint::new(
            table,
            Some(KeyValue::Int(watermark)),
            TableDigest::of_rows(1, [&row[..]]),
        )
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp"), b"key".to_vec());
        store.init().await.unwrap();

        assert!(store.load("dbo.orders").await.unwrap().is_none());
        let cp = checkpoint("dbo.orders", 42);
        store.save(&cp).await.unwrap();

        let loaded = store.load("dbo.orders").await.unwrap().unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(store.list().await.unwrap().len(), 1);

        assert!(store.remove("dbo.orders").await.unwrap());
        assert!(!store.remove("dbo.orders").await.unwrap());
        assert!(store.load("dbo.orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_overwrite_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), b"key".to_vec());
        store.save(&checkpoint("dbo.orders", 1)).await.unwrap();
        store.save(&checkpoint("dbo.orders", 2)).await.unwrap();

        let loaded = store.load("dbo.orders").await.unwrap().unwrap();
        assert_eq!(loaded.watermark, Some(KeyValue::Int(2)));
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_survives_interrupted_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), b"key".to_vec());
        store.save(&checkpoint("dbo.orders", 1)).await.unwrap();

        // a save cut off before its rename leaves an empty temp file behind
        let temp = store.path_for("dbo.orders").with_extension("tmp");
        std::fs::write(&temp, b"").unwrap();

        let loaded = store.load("dbo.orders").await.unwrap().unwrap();
        assert_eq!(loaded.watermark, Some(KeyValue::Int(1)));
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.save(&checkpoint("dbo.orders", 2)).await.unwrap();
        assert!(!temp.exists());
        let loaded = store.load("dbo.orders").await.unwrap().unwrap();
        assert_eq!(loaded.watermark, Some(KeyValue::Int(2)));
    }

    #[tokio::test]
    async fn test_file_store_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), b"key".to_vec());
        store.save(&checkpoint("dbo.orders", 10)).await.unwrap();

        let path = store.path_for("dbo.orders");
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("\"value\": 10", "\"value\": 99")).unwrap();

        let err = store.load("dbo.orders").await.unwrap_err();
        assert!(err.to_string().contains("HMAC mismatch"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_rejects_other_key() {
        let dir = tempfile::tempdir().unwrap();
        FileCheckpointStore::new(dir.path(), b"one".to_vec())
            .save(&checkpoint("dbo.orders", 10))
            .await
            .unwrap();
        let other = FileCheckpointStore::new(dir.path(), b"two".to_vec());
        assert!(other.load("dbo.orders").await.is_err());
    }

    #[test]
    fn test_path_names_do_not_collide() {
        let store = FileCheckpointStore::new("/tmp/cp", Vec::new());
        let a = store.path_for("dbo.a b");
        let b = store.path_for("dbo.a_b");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().contains("dbo.a_b-"));
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryCheckpointStore::new();
        store.fail_next_saves(1);
        assert!(store.save(&checkpoint("dbo.t", 1)).await.is_err());
        assert!(store.load("dbo.t").await.unwrap().is_none());

        store.save(&checkpoint("dbo.t", 2)).await.unwrap();
        assert_eq!(store.saves(), 1);
        assert_eq!(
            store.load("dbo.t").await.unwrap().unwrap().watermark,
            Some(KeyValue::Int(2))
        );
    }

    #[tokio::test]
    async fn test_open_store_follows_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "source: {{type: mssql, host: a, database: d, user: u}}\n\
             target: {{type: postgres, host: b, database: d, user: u}}\n\
             tables:\n  - {{name: x, primary_key: [id]}}\n\
             checkpoint: {{store: file, path: '{}'}}\n",
            dir.path().join("cp").display()
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let store = open_store(&config, &crate::observe::ConfigCredentials).await.unwrap();
        assert_eq!(store.store_type(), "file");
        store.save(&checkpoint("dbo.x", 1)).await.unwrap();
        assert!(dir.path().join("cp").is_dir());

        let memory = Config::from_yaml(&yaml.replace("store: file", "store: memory")).unwrap();
        let store = open_store(&memory, &crate::observe::ConfigCredentials).await.unwrap();
        assert_eq!(store.store_type(), "memory");
    }
}
