#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lumos-storage** – Per-app persistent key-value stores.
//!
//! Each app owns one JSON document at `<data_root>/apps/<sanitized>/store.json`
//! with a hard quota. App identifiers are sanitized before they ever touch a
//! path, so traversal out of the apps directory is structurally impossible.
//!
//! Writes are debounced (~500 ms) and coalesced per app; a graceful shutdown
//! calls [`Storage::flush_all`], which synchronously drains every dirty
//! entry. A corrupted on-disk store produces a warning and a clean start for
//! that app.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use lumos_types::{sanitize_app_id, JsonMap};

/// Default per-app quota: 5 MiB of serialized JSON.
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Default debounce window for coalesced writes.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Storage errors surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The write would push the serialized store past its quota.
    #[error("quota_exceeded: store would grow to {attempted} bytes (quota {quota})")]
    QuotaExceeded {
        /// Serialized size the write would have produced.
        attempted: u64,
        /// The configured quota.
        quota: u64,
    },
    /// Filesystem failure.
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("storage serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Configuration for the storage layer.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory; app stores live under `<data_root>/apps/`.
    pub data_root: PathBuf,
    /// Per-app quota in serialized bytes.
    pub quota_bytes: u64,
    /// Debounce window for background flushes.
    pub debounce: Duration,
}

impl StorageConfig {
    /// Config with defaults rooted at `data_root`.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }
}

#[derive(Default)]
struct StoreEntry {
    data: JsonMap,
    dirty: bool,
    flush_pending: bool,
}

struct StorageInner {
    config: StorageConfig,
    cache: Mutex<HashMap<String, StoreEntry>>,
}

/// Handle to the per-app storage layer. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Create a storage layer over `config`.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                config,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn store_path(&self, sanitized: &str) -> PathBuf {
        self.inner
            .config
            .data_root
            .join("apps")
            .join(sanitized)
            .join("store.json")
    }

    /// Load an app's store into the cache if absent. Corrupted files are
    /// tolerated: the app starts fresh and the old content is overwritten on
    /// the next flush.
    async fn ensure_loaded(&self, sanitized: &str) -> Result<(), StorageError> {
        {
            let cache = self.inner.cache.lock().await;
            if cache.contains_key(sanitized) {
                return Ok(());
            }
        }
        let path = self.store_path(sanitized);
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<JsonMap>(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(app = sanitized, error = %e, "corrupted store.json, starting fresh");
                    JsonMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => JsonMap::new(),
            Err(e) => return Err(e.into()),
        };
        let mut cache = self.inner.cache.lock().await;
        cache.entry(sanitized.to_string()).or_insert(StoreEntry {
            data,
            dirty: false,
            flush_pending: false,
        });
        Ok(())
    }

    /// Read a value.
    pub async fn get(&self, app_id: &str, key: &str) -> Result<Option<Value>, StorageError> {
        let sanitized = sanitize_app_id(app_id);
        self.ensure_loaded(&sanitized).await?;
        let cache = self.inner.cache.lock().await;
        Ok(cache
            .get(&sanitized)
            .and_then(|entry| entry.data.get(key))
            .cloned())
    }

    /// Write a value, enforcing the quota.
    ///
    /// A rejected write leaves the store exactly as it was.
    pub async fn set(&self, app_id: &str, key: &str, value: Value) -> Result<(), StorageError> {
        let sanitized = sanitize_app_id(app_id);
        self.ensure_loaded(&sanitized).await?;
        {
            let mut cache = self.inner.cache.lock().await;
            let entry = cache.entry(sanitized.clone()).or_default();

            let previous = entry.data.insert(key.to_string(), value);
            let serialized = serde_json::to_vec(&entry.data)?;
            if serialized.len() as u64 > self.inner.config.quota_bytes {
                // Roll back before reporting.
                match previous {
                    Some(old) => {
                        entry.data.insert(key.to_string(), old);
                    }
                    None => {
                        entry.data.remove(key);
                    }
                }
                return Err(StorageError::QuotaExceeded {
                    attempted: serialized.len() as u64,
                    quota: self.inner.config.quota_bytes,
                });
            }
            entry.dirty = true;
        }
        self.schedule_flush(sanitized).await;
        Ok(())
    }

    /// Remove a key.
    pub async fn remove(&self, app_id: &str, key: &str) -> Result<(), StorageError> {
        let sanitized = sanitize_app_id(app_id);
        self.ensure_loaded(&sanitized).await?;
        let mut changed = false;
        {
            let mut cache = self.inner.cache.lock().await;
            if let Some(entry) = cache.get_mut(&sanitized) {
                if entry.data.remove(key).is_some() {
                    entry.dirty = true;
                    changed = true;
                }
            }
        }
        if changed {
            self.schedule_flush(sanitized).await;
        }
        Ok(())
    }

    /// All keys in an app's store.
    pub async fn keys(&self, app_id: &str) -> Result<Vec<String>, StorageError> {
        let sanitized = sanitize_app_id(app_id);
        self.ensure_loaded(&sanitized).await?;
        let cache = self.inner.cache.lock().await;
        Ok(cache
            .get(&sanitized)
            .map(|entry| entry.data.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Serialized size and quota for an app.
    pub async fn usage(&self, app_id: &str) -> Result<(u64, u64), StorageError> {
        let sanitized = sanitize_app_id(app_id);
        self.ensure_loaded(&sanitized).await?;
        let cache = self.inner.cache.lock().await;
        let used = cache
            .get(&sanitized)
            .map(|entry| serde_json::to_vec(&entry.data).map(|v| v.len() as u64))
            .transpose()?
            .unwrap_or(0);
        Ok((used, self.inner.config.quota_bytes))
    }

    /// Remove every key but keep the store file.
    pub async fn clear(&self, app_id: &str) -> Result<(), StorageError> {
        let sanitized = sanitize_app_id(app_id);
        self.ensure_loaded(&sanitized).await?;
        {
            let mut cache = self.inner.cache.lock().await;
            if let Some(entry) = cache.get_mut(&sanitized) {
                entry.data.clear();
                entry.dirty = true;
            }
        }
        self.schedule_flush(sanitized).await;
        Ok(())
    }

    /// Delete an app's store entirely: cache entry and on-disk directory.
    pub async fn delete(&self, app_id: &str) -> Result<(), StorageError> {
        let sanitized = sanitize_app_id(app_id);
        self.inner.cache.lock().await.remove(&sanitized);
        let dir = self.inner.config.data_root.join("apps").join(&sanitized);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot of an app's full store.
    pub async fn export(&self, app_id: &str) -> Result<JsonMap, StorageError> {
        let sanitized = sanitize_app_id(app_id);
        self.ensure_loaded(&sanitized).await?;
        let cache = self.inner.cache.lock().await;
        Ok(cache
            .get(&sanitized)
            .map(|entry| entry.data.clone())
            .unwrap_or_default())
    }

    /// Replace an app's store wholesale, subject to quota.
    pub async fn import(&self, app_id: &str, data: JsonMap) -> Result<(), StorageError> {
        let serialized = serde_json::to_vec(&data)?;
        if serialized.len() as u64 > self.inner.config.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                attempted: serialized.len() as u64,
                quota: self.inner.config.quota_bytes,
            });
        }
        let sanitized = sanitize_app_id(app_id);
        {
            let mut cache = self.inner.cache.lock().await;
            let entry = cache.entry(sanitized.clone()).or_default();
            entry.data = data;
            entry.dirty = true;
        }
        self.schedule_flush(sanitized).await;
        Ok(())
    }

    /// App ids (sanitized form) present on disk or in the cache.
    pub async fn list_apps(&self) -> Result<Vec<String>, StorageError> {
        let mut apps: Vec<String> = {
            let cache = self.inner.cache.lock().await;
            cache.keys().cloned().collect()
        };
        let apps_dir = self.inner.config.data_root.join("apps");
        match tokio::fs::read_dir(&apps_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        let name = entry.file_name().to_string_lossy().to_string();
                        if !apps.contains(&name) {
                            apps.push(name);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        apps.sort();
        Ok(apps)
    }

    /// Export every app's store, keyed by sanitized app id.
    pub async fn export_all(&self) -> Result<HashMap<String, JsonMap>, StorageError> {
        let mut out = HashMap::new();
        for app in self.list_apps().await? {
            out.insert(app.clone(), self.export(&app).await?);
        }
        Ok(out)
    }

    /// Synchronously drain every dirty entry to disk. Called on graceful
    /// shutdown; also safe to call at any time.
    pub async fn flush_all(&self) -> Result<(), StorageError> {
        let dirty: Vec<String> = {
            let cache = self.inner.cache.lock().await;
            cache
                .iter()
                .filter(|(_, entry)| entry.dirty)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for app in dirty {
            self.flush_one(&app).await?;
        }
        Ok(())
    }

    /// Arrange a debounced flush; writes landing inside the window coalesce.
    async fn schedule_flush(&self, sanitized: String) {
        {
            let mut cache = self.inner.cache.lock().await;
            match cache.get_mut(&sanitized) {
                Some(entry) if !entry.flush_pending => entry.flush_pending = true,
                _ => return,
            }
        }
        let this = self.clone();
        let debounce = self.inner.config.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(e) = this.flush_one(&sanitized).await {
                warn!(app = %sanitized, error = %e, "debounced flush failed");
            }
        });
    }

    async fn flush_one(&self, sanitized: &str) -> Result<(), StorageError> {
        let serialized = {
            let mut cache = self.inner.cache.lock().await;
            match cache.get_mut(sanitized) {
                Some(entry) => {
                    entry.dirty = false;
                    entry.flush_pending = false;
                    serde_json::to_vec_pretty(&entry.data)?
                }
                None => return Ok(()),
            }
        };
        let path = self.store_path(sanitized);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serialized).await?;
        debug!(app = sanitized, "flushed store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage_at(dir: &std::path::Path) -> Storage {
        Storage::new(StorageConfig::new(dir))
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_at(dir.path());
        storage.set("app", "k", json!({"v": 1})).await.unwrap();
        assert_eq!(storage.get("app", "k").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn failing_set_does_not_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::new(dir.path());
        config.quota_bytes = 64;
        let storage = Storage::new(config);

        storage.set("app", "small", json!("x")).await.unwrap();
        let big = "y".repeat(256);
        let err = storage.set("app", "big", json!(big)).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert_eq!(storage.get("app", "big").await.unwrap(), None);
        assert_eq!(storage.get("app", "small").await.unwrap(), Some(json!("x")));
    }

    #[tokio::test]
    async fn quota_rollback_restores_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::new(dir.path());
        config.quota_bytes = 64;
        let storage = Storage::new(config);

        storage.set("app", "k", json!("old")).await.unwrap();
        let big = "z".repeat(256);
        assert!(storage.set("app", "k", json!(big)).await.is_err());
        assert_eq!(storage.get("app", "k").await.unwrap(), Some(json!("old")));
    }

    #[tokio::test]
    async fn traversal_app_id_stays_under_apps_dir() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_at(dir.path());
        storage.set("../../../etc", "k", json!(1)).await.unwrap();
        storage.flush_all().await.unwrap();

        let expected = dir.path().join("apps").join("______etc").join("store.json");
        assert!(expected.exists());
        // Nothing escaped the apps directory.
        assert!(!dir.path().join("etc").exists());
    }

    #[tokio::test]
    async fn flush_all_persists_and_reload_sees_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = storage_at(dir.path());
            storage.set("app", "k", json!(42)).await.unwrap();
            storage.flush_all().await.unwrap();
        }
        let storage = storage_at(dir.path());
        assert_eq!(storage.get("app", "k").await.unwrap(), Some(json!(42)));
    }

    #[tokio::test]
    async fn corrupted_store_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("apps").join("app");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("store.json"), b"{ not json").unwrap();

        let storage = storage_at(dir.path());
        assert_eq!(storage.get("app", "k").await.unwrap(), None);
        storage.set("app", "k", json!("fresh")).await.unwrap();
        assert_eq!(storage.get("app", "k").await.unwrap(), Some(json!("fresh")));
    }

    #[tokio::test]
    async fn clear_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_at(dir.path());
        storage.set("app", "a", json!(1)).await.unwrap();
        storage.set("app", "b", json!(2)).await.unwrap();
        let mut keys = storage.keys("app").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        storage.clear("app").await.unwrap();
        assert!(storage.keys("app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_at(dir.path());
        storage.set("app", "k", json!(1)).await.unwrap();
        storage.flush_all().await.unwrap();
        storage.delete("app").await.unwrap();
        assert!(!dir.path().join("apps").join("app").exists());
        assert_eq!(storage.get("app", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_at(dir.path());
        storage.set("src", "k", json!([1, 2, 3])).await.unwrap();
        let exported = storage.export("src").await.unwrap();
        storage.import("dst", exported).await.unwrap();
        assert_eq!(storage.get("dst", "k").await.unwrap(), Some(json!([1, 2, 3])));
    }
}
