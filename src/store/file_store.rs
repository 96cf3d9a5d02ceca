//! File-backed document store
//!
//! Each document is one JSON file under the data directory. Writes go to a
//! temporary file that is renamed over the canonical path, so the canonical
//! file is always a complete document. All operations on one key are
//! serialized through a per-key async mutex.

use crate::STORE_TARGET;
use crate::store::backup::{self, BackupEntry};
use crate::store::{StoreError, StoreResult};
use chrono::Utc;
use dashmap::DashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Number of backups kept per document unless configured otherwise
pub const DEFAULT_BACKUP_RETENTION: usize = 5;

/// A stored JSON document. The store imposes no schema.
pub type Document = serde_json::Value;

/// Where and how documents are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding `<key>.json` files
    pub data_dir: PathBuf,
    /// Directory holding `<key>.<timestamp>.bak` files
    pub backup_dir: PathBuf,
    /// Backups retained per key
    pub backup_retention: usize,
}

impl StoreConfig {
    /// Store documents in `data_dir`, with backups in `data_dir/backups`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            backup_dir: data_dir.join("backups"),
            data_dir,
            backup_retention: DEFAULT_BACKUP_RETENTION,
        }
    }
}

/// Cached, crash-safe storage of named JSON documents
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileStoreInner>,
}

struct FileStoreInner {
    config: StoreConfig,
    cache: DashMap<String, Document>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("config", &self.inner.config)
            .field("cached", &self.inner.cache.len())
            .finish()
    }
}

impl FileStore {
    /// Create a store; directories are created lazily on first write
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(FileStoreInner {
                config,
                cache: DashMap::new(),
                locks: DashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn validate_key(key: &str) -> StoreResult<()> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidKey(key.to_string()))
        }
    }

    fn document_path(&self, key: &str) -> PathBuf {
        self.inner.config.data_dir.join(format!("{key}.json"))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.inner.config.data_dir.join(format!("{key}.json.tmp"))
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.inner.locks.entry(key.to_string()).or_default())
    }

    /// Whether a document is currently held in the cache
    #[must_use]
    pub fn is_cached(&self, key: &str) -> bool {
        self.inner.cache.contains_key(key)
    }

    /// Read a document.
    ///
    /// Returns an owned snapshot; changes to it are not visible to other
    /// readers until written back. A missing document is `Ok(None)`.
    ///
    /// # Errors
    /// - `InvalidKey` if the key is not filename-safe
    /// - `CorruptData` if the file is not valid JSON
    /// - `Io` for any other read failure
    pub async fn read(&self, key: &str) -> StoreResult<Option<Document>> {
        Self::validate_key(key)?;
        if let Some(entry) = self.inner.cache.get(key) {
            return Ok(Some(entry.value().clone()));
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        self.read_locked(key).await
    }

    async fn read_locked(&self, key: &str) -> StoreResult<Option<Document>> {
        if let Some(entry) = self.inner.cache.get(key) {
            return Ok(Some(entry.value().clone()));
        }

        let path = self.document_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(key, e)),
        };

        let document: Document = serde_json::from_slice(&bytes).map_err(|source| {
            error!(
                target: STORE_TARGET,
                key = %key,
                path = %path.display(),
                error = %source,
                "Document on disk is not valid JSON"
            );
            StoreError::CorruptData {
                key: key.to_string(),
                source,
            }
        })?;

        self.inner.cache.insert(key.to_string(), document.clone());
        debug!(target: STORE_TARGET, key = %key, "Loaded document from disk");
        Ok(Some(document))
    }

    /// Write a document, backing up the previous version first.
    ///
    /// # Errors
    /// - `InvalidKey` if the key is not filename-safe
    /// - `WriteFailure` if any step fails; the previous document is left
    ///   readable and the cache is untouched
    pub async fn write(&self, key: &str, document: &Document) -> StoreResult<()> {
        Self::validate_key(key)?;
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        self.write_locked(key, document).await
    }

    async fn write_locked(&self, key: &str, document: &Document) -> StoreResult<()> {
        let config = &self.inner.config;
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| StoreError::write_failure(key, io::Error::other(e)))?;

        fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| StoreError::write_failure(key, e))?;

        let path = self.document_path(key);
        let backup = backup::create(&config.backup_dir, key, &path, Utc::now())
            .await
            .map_err(|e| {
                error!(
                    target: STORE_TARGET,
                    key = %key,
                    error = %e,
                    "Could not back up document, write aborted"
                );
                StoreError::write_failure(key, e)
            })?;

        let tmp = self.temp_path(key);
        if let Err(e) = replace_file(&path, &tmp, &bytes).await {
            error!(
                target: STORE_TARGET,
                key = %key,
                error = %e,
                "Document write failed, rolling back"
            );
            self.roll_back(key, &path, &tmp, backup.as_deref()).await;
            return Err(StoreError::write_failure(key, e));
        }

        self.inner.cache.insert(key.to_string(), document.clone());

        match backup::prune(&config.backup_dir, key, config.backup_retention).await {
            Ok(0) => {}
            Ok(removed) => {
                debug!(target: STORE_TARGET, key = %key, removed, "Pruned old backups");
            }
            Err(e) => {
                warn!(target: STORE_TARGET, key = %key, error = %e, "Failed to prune backups");
            }
        }

        debug!(target: STORE_TARGET, key = %key, bytes = bytes.len(), "Document written");
        Ok(())
    }

    /// Put the canonical file back into its pre-write state after a failure
    async fn roll_back(&self, key: &str, path: &Path, tmp: &Path, backup: Option<&Path>) {
        if let Err(e) = fs::remove_file(tmp).await {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(target: STORE_TARGET, key = %key, error = %e, "Could not remove temp file");
            }
        }

        let Some(backup) = backup else {
            return;
        };

        let intact = match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<Document>(&bytes).is_ok(),
            Err(_) => false,
        };
        if intact {
            return;
        }

        let restored = match fs::read(backup).await {
            Ok(bytes) => replace_file(path, tmp, &bytes).await,
            Err(e) => Err(e),
        };
        match restored {
            Ok(()) => {
                warn!(
                    target: STORE_TARGET,
                    key = %key,
                    backup = %backup.display(),
                    "Restored document from backup"
                );
            }
            Err(e) => {
                error!(
                    target: STORE_TARGET,
                    key = %key,
                    backup = %backup.display(),
                    error = %e,
                    "Failed to restore document from backup"
                );
            }
        }
    }

    /// Read-modify-write a document under its key lock.
    ///
    /// The closure receives the current document (`None` if absent). The
    /// document is written back only if the closure changed it.
    ///
    /// # Errors
    /// Any store error, or the closure's own error (nothing is written then).
    pub async fn update<T, E, F>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Option<Document>) -> Result<T, E>,
        E: From<StoreError>,
    {
        Self::validate_key(key)?;
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let original = self.read_locked(key).await?;
        let mut document = original.clone();
        let output = f(&mut document)?;

        if let Some(updated) = &document {
            if original.as_ref() != Some(updated) {
                self.write_locked(key, updated).await?;
            }
        }
        Ok(output)
    }

    /// Delete a document. Returns `false` if it did not exist.
    ///
    /// Backups are kept for manual recovery.
    ///
    /// # Errors
    /// `InvalidKey`, or `Io` if the file exists but cannot be removed.
    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        Self::validate_key(key)?;
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let removed = match fs::remove_file(self.document_path(key)).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::io(key, e)),
        };
        self.inner.cache.remove(key);

        if removed {
            info!(target: STORE_TARGET, key = %key, "Document deleted");
        }
        Ok(removed)
    }

    /// Evict one document from the cache, or everything with `None`
    pub fn clear_cache(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.inner.cache.remove(key);
            }
            None => self.inner.cache.clear(),
        }
    }

    /// Retained backups for a document, oldest first
    ///
    /// # Errors
    /// `InvalidKey`, or `Io` if the backup directory cannot be listed.
    pub fn backups(&self, key: &str) -> StoreResult<Vec<BackupEntry>> {
        Self::validate_key(key)?;
        backup::list(&self.inner.config.backup_dir, key).map_err(|e| StoreError::io(key, e))
    }

    /// Replace a document with the contents of one of its backups.
    ///
    /// The current version is itself backed up by the write.
    ///
    /// # Errors
    /// `CorruptData` if the backup is not valid JSON, otherwise as `write`.
    pub async fn restore_backup(&self, key: &str, entry: &BackupEntry) -> StoreResult<Document> {
        Self::validate_key(key)?;
        let bytes = fs::read(&entry.path)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        let document: Document =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::CorruptData {
                key: key.to_string(),
                source,
            })?;

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        self.write_locked(key, &document).await?;

        info!(
            target: STORE_TARGET,
            key = %key,
            backup = %entry.path.display(),
            "Document restored from backup"
        );
        Ok(document)
    }
}

async fn replace_file(path: &Path, tmp: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store(retention: usize) -> (TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StoreConfig::new(dir.path().join("data"));
        config.backup_retention = retention;
        (dir, FileStore::new(config))
    }

    #[tokio::test]
    async fn test_read_nonexistent_is_none() {
        let (_dir, store) = test_store(5);
        assert!(store.read("nonexistent").await.unwrap().is_none());
        assert!(!store.is_cached("nonexistent"));
    }

    #[tokio::test]
    async fn test_write_then_read_from_disk() {
        let (_dir, store) = test_store(5);
        let document = json!({
            "12345": { "balance": 250, "last_daily": null },
            "67890": { "balance": -3, "tags": ["a", "b"] }
        });

        store.write("economy", &document).await.unwrap();
        assert!(store.is_cached("economy"));

        store.clear_cache(None);
        assert!(!store.is_cached("economy"));

        let loaded = store.read("economy").await.unwrap().unwrap();
        assert_eq!(loaded, document);
        assert!(store.is_cached("economy"));
    }

    #[tokio::test]
    async fn test_invalid_keys_are_rejected() {
        let (_dir, store) = test_store(5);
        for key in ["", "../escape", "a.b", "with space"] {
            assert!(matches!(
                store.read(key).await,
                Err(StoreError::InvalidKey(_))
            ));
        }
        assert!(store.write("guild-config_2", &json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_surfaced() {
        let (_dir, store) = test_store(5);
        let data_dir = &store.config().data_dir;
        fs::create_dir_all(data_dir).await.unwrap();
        fs::write(data_dir.join("leveling.json"), b"{\"truncated\": ")
            .await
            .unwrap();

        let result = store.read("leveling").await;
        assert!(matches!(result, Err(StoreError::CorruptData { .. })));
        assert!(!store.is_cached("leveling"));
    }

    #[tokio::test]
    async fn test_read_returns_snapshot() {
        let (_dir, store) = test_store(5);
        store.write("economy", &json!({ "1": 10 })).await.unwrap();

        let mut snapshot = store.read("economy").await.unwrap().unwrap();
        snapshot["1"] = json!(9999);

        let again = store.read("economy").await.unwrap().unwrap();
        assert_eq!(again, json!({ "1": 10 }));
    }

    #[tokio::test]
    async fn test_backup_rotation_keeps_newest() {
        let retention = 3;
        let (_dir, store) = test_store(retention);

        // The first write has nothing to back up
        for version in 0..=retention {
            store
                .write("punishments", &json!({ "version": version }))
                .await
                .unwrap();
        }
        assert_eq!(store.backups("punishments").unwrap().len(), retention);

        for version in retention + 1..retention + 4 {
            store
                .write("punishments", &json!({ "version": version }))
                .await
                .unwrap();
        }

        let backups = store.backups("punishments").unwrap();
        assert_eq!(backups.len(), retention);

        // Latest write was version 6, so backups hold versions 3, 4 and 5
        for (entry, expected) in backups.iter().zip(3..) {
            let bytes = fs::read(&entry.path).await.unwrap();
            let document: Document = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(document, json!({ "version": expected }));
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_previous_document() {
        let (_dir, store) = test_store(5);
        let balances = json!({ "U1": { "balance": 500 } });
        store.write("economy", &balances).await.unwrap();

        // A directory squatting on the temp path makes the write fail midway
        fs::create_dir_all(store.temp_path("economy")).await.unwrap();

        let result = store
            .write("economy", &json!({ "U1": { "balance": 0 } }))
            .await;
        assert!(matches!(result, Err(StoreError::WriteFailure { .. })));

        assert_eq!(store.read("economy").await.unwrap().unwrap(), balances);
        store.clear_cache(Some("economy"));
        assert_eq!(store.read("economy").await.unwrap().unwrap(), balances);
    }

    #[tokio::test]
    async fn test_unusable_backup_dir_aborts_write() {
        let dir = tempfile::tempdir().unwrap();
        let backup_file = dir.path().join("not-a-dir");
        fs::write(&backup_file, b"").await.unwrap();
        let config = StoreConfig {
            data_dir: dir.path().join("data"),
            backup_dir: backup_file,
            backup_retention: 5,
        };
        let store = FileStore::new(config);

        // Nothing to back up yet, so the first write succeeds
        store.write("reminders", &json!([1])).await.unwrap();

        let result = store.write("reminders", &json!([1, 2])).await;
        assert!(matches!(result, Err(StoreError::WriteFailure { .. })));

        store.clear_cache(None);
        assert_eq!(store.read("reminders").await.unwrap().unwrap(), json!([1]));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, store) = test_store(5);
        store.write("leveling", &json!({})).await.unwrap();

        assert!(store.delete("leveling").await.unwrap());
        assert!(!store.is_cached("leveling"));
        assert!(store.read("leveling").await.unwrap().is_none());
        assert!(!store.delete("leveling").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_writes_only_on_change() {
        let (_dir, store) = test_store(5);
        store.write("economy", &json!({ "1": 1 })).await.unwrap();

        let unchanged: Result<(), StoreError> = store.update("economy", |_| Ok(())).await;
        unchanged.unwrap();
        assert!(store.backups("economy").unwrap().is_empty());

        let previous: Result<i64, StoreError> = store
            .update("economy", |document| {
                let document = document.get_or_insert_with(|| json!({}));
                let previous = document["1"].as_i64().unwrap_or_default();
                document["1"] = json!(previous + 1);
                Ok(previous)
            })
            .await;
        assert_eq!(previous.unwrap(), 1);
        assert_eq!(store.backups("economy").unwrap().len(), 1);
        assert_eq!(store.read("economy").await.unwrap().unwrap(), json!({ "1": 2 }));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let (_dir, store) = test_store(2);
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let result: Result<(), StoreError> = store
                    .update("counter", |document| {
                        let document = document.get_or_insert_with(|| json!({ "count": 0 }));
                        let count = document["count"].as_u64().unwrap_or_default();
                        document["count"] = json!(count + 1);
                        Ok(())
                    })
                    .await;
                result.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        store.clear_cache(None);
        let document = store.read("counter").await.unwrap().unwrap();
        assert_eq!(document["count"], json!(20));
    }

    #[tokio::test]
    async fn test_restore_backup() {
        let (_dir, store) = test_store(5);
        store.write("reminders", &json!({ "v": 1 })).await.unwrap();
        store.write("reminders", &json!({ "v": 2 })).await.unwrap();

        let backups = store.backups("reminders").unwrap();
        let restored = store.restore_backup("reminders", &backups[0]).await.unwrap();
        assert_eq!(restored, json!({ "v": 1 }));

        store.clear_cache(None);
        assert_eq!(store.read("reminders").await.unwrap().unwrap(), json!({ "v": 1 }));
        // Restoring backs up version 2 first
        assert_eq!(store.backups("reminders").unwrap().len(), 2);
    }
}
