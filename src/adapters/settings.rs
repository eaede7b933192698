//! File-backed Settings Store
//!
//! A small JSON key/value file, rewritten atomically (temp file + rename) on
//! every mutation. Values are expected to be small scalars or short JSON
//! documents; this is not a general database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::ports::SettingsStore;
use crate::error::Result;

/// JSON-file settings store
pub struct FileSettingsStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileSettingsStore {
    /// Open (or create) the settings file at `path`.
    ///
    /// An unreadable file is logged and replaced with an empty store rather
    /// than failing startup.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let values = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Settings file corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), keys = values.len(), "Opened settings store");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(values)?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value);
        self.persist(&values).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().await;
        if values.remove(key).is_some() {
            self.persist(&values).await?;
        }
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        let mut values = self.values.lock().await;
        let before = values.len();
        values.retain(|k, _| !k.starts_with(prefix));
        let removed = (before - values.len()) as u64;
        if removed > 0 {
            self.persist(&values).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = FileSettingsStore::open(&path).await.unwrap();
        store.put("presence.p1", "{\"x\":1}".into()).await.unwrap();
        store.put("profile.record", "{}".into()).await.unwrap();
        store.remove("profile.record").await.unwrap();
        drop(store);

        let reopened = FileSettingsStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("presence.p1").await.unwrap().as_deref(),
            Some("{\"x\":1}")
        );
        assert_eq!(reopened.get("profile.record").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let store = FileSettingsStore::open(&path).await.unwrap();
        assert_eq!(store.get("anything").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_prefix_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = FileSettingsStore::open(&path).await.unwrap();
        store.put("a.1", "1".into()).await.unwrap();
        store.put("a.2", "2".into()).await.unwrap();
        store.put("b.1", "3".into()).await.unwrap();
        assert_eq!(store.remove_prefix("a.").await.unwrap(), 2);

        let reopened = FileSettingsStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("b.1").await.unwrap().as_deref(), Some("3"));
        assert_eq!(reopened.get("a.1").await.unwrap(), None);
    }
}
