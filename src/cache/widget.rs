//! Widget Export Cache
//!
//! One-way projection of already-cached data into a directory another
//! process reads. Layout:
//!
//! ```text
//! <directory>/
//!   snapshot.json        scalar fields plus references to thumbnails
//!   thumb_<slot>.<ext>   one thumbnail per exported image
//!   index.json           every file written by the last exports
//! ```
//!
//! Every file is written to a temporary name and renamed into place so the
//! reader never sees a partial file. After each export the surfaces are asked
//! to re-render. Stale files are purged on their own schedule.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::thumbnail;
use crate::cache::metrics::{CacheCounters, ComponentMetrics, MissReason};
use crate::cache::spawn_periodic;
use crate::cache::ttl::{secs, to_chrono};
use crate::clock::Clock;
use crate::domain::ports::{Surface, SurfaceNotifier, ThumbnailEncoder};
use crate::domain::{CacheEvent, ChangeFeed};
use crate::error::Result;

const SNAPSHOT_FILE: &str = "snapshot.json";
const INDEX_FILE: &str = "index.json";

/// Widget export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetConfig {
    /// Directory shared with the widget process
    pub directory: PathBuf,
    /// Files older than this are purged
    #[serde(with = "secs")]
    pub retention: Duration,
    #[serde(with = "secs")]
    pub purge_interval: Duration,
    /// Longest thumbnail edge handed to the encoder
    pub thumbnail_max_dimension: u32,
    /// Surfaces asked to re-render after an export
    pub surfaces: Vec<Surface>,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("widget"),
            retention: Duration::from_secs(7 * 24 * 3600),
            purge_interval: Duration::from_secs(6 * 3600),
            thumbnail_max_dimension: 256,
            surfaces: vec![Surface::HomeWidget, Surface::LockScreen],
        }
    }
}

/// An image to export under a named slot (e.g. `user_avatar`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetImage {
    pub slot: String,
    pub bytes: Bytes,
}

impl WidgetImage {
    pub fn new(slot: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            slot: slot.into(),
            bytes: bytes.into(),
        }
    }
}

/// Thumbnail reference inside the snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailRef {
    pub file: String,
    pub width: u32,
    pub height: u32,
}

/// Contents of `snapshot.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetSnapshot {
    pub exported_at: DateTime<Utc>,
    /// Scalar fields rendered by the widget
    pub fields: Value,
    /// Slot -> thumbnail
    #[serde(default)]
    pub images: BTreeMap<String, ThumbnailRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexEntry {
    written_at: DateTime<Utc>,
    size_bytes: u64,
}

/// Contents of `index.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct WidgetIndex {
    files: BTreeMap<String, IndexEntry>,
}

impl WidgetIndex {
    fn size_bytes(&self) -> u64 {
        self.files.values().map(|e| e.size_bytes).sum()
    }
}

/// Widget export cache
pub struct WidgetCache {
    directory: PathBuf,
    encoder: Arc<dyn ThumbnailEncoder>,
    notifier: Arc<dyn SurfaceNotifier>,
    clock: Arc<dyn Clock>,
    config: WidgetConfig,
    /// In-memory copy of index.json
    index: RwLock<WidgetIndex>,
    /// Single writer for the directory
    write_lock: tokio::sync::Mutex<()>,
    counters: CacheCounters,
    feed: ChangeFeed,
}

impl WidgetCache {
    pub fn new(
        encoder: Arc<dyn ThumbnailEncoder>,
        notifier: Arc<dyn SurfaceNotifier>,
        clock: Arc<dyn Clock>,
        config: WidgetConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;
        Ok(Self {
            directory: config.directory.clone(),
            encoder,
            notifier,
            clock,
            config,
            index: RwLock::new(WidgetIndex::default()),
            write_lock: tokio::sync::Mutex::new(()),
            counters: CacheCounters::new(),
            feed: ChangeFeed::default(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write the snapshot and thumbnails, then ask every surface to reload
    #[instrument(skip(self, fields, images), fields(images = images.len()))]
    pub async fn export(&self, fields: Value, images: Vec<WidgetImage>) -> Result<WidgetSnapshot> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let mut index = self.index.read().clone();

        let mut refs = BTreeMap::new();
        for image in &images {
            let thumb = match self
                .encoder
                .encode(&image.bytes, self.config.thumbnail_max_dimension)
            {
                Ok(thumb) => thumb,
                Err(e) => {
                    warn!(slot = %image.slot, error = %e, "Thumbnail encoding failed, slot skipped");
                    self.counters.record_storage_failure();
                    continue;
                }
            };
            let info = match thumbnail::probe(&thumb.bytes) {
                Ok(info) => info,
                Err(e) => {
                    warn!(slot = %image.slot, error = %e, "Encoder produced an unreadable thumbnail");
                    self.counters.record_storage_failure();
                    continue;
                }
            };

            let file = format!("thumb_{}.{}", sanitize(&image.slot), thumb.extension);
            self.write_atomic(&file, &thumb.bytes).await?;
            index.files.insert(
                file.clone(),
                IndexEntry {
                    written_at: now,
                    size_bytes: thumb.bytes.len() as u64,
                },
            );
            refs.insert(
                image.slot.clone(),
                ThumbnailRef {
                    file,
                    width: info.width,
                    height: info.height,
                },
            );
        }

        // Thumbnails from earlier exports are no longer referenced
        let current: Vec<&str> = refs.values().map(|r| r.file.as_str()).collect();
        index
            .files
            .retain(|name, _| name == SNAPSHOT_FILE || current.contains(&name.as_str()));

        let snapshot = WidgetSnapshot {
            exported_at: now,
            fields,
            images: refs,
        };
        let raw = serde_json::to_vec_pretty(&snapshot)?;
        self.write_atomic(SNAPSHOT_FILE, &raw).await?;
        index.files.insert(
            SNAPSHOT_FILE.to_string(),
            IndexEntry {
                written_at: now,
                size_bytes: raw.len() as u64,
            },
        );

        self.write_index(&index).await?;
        let files = index.files.len();
        *self.index.write() = index;
        self.counters.record_write();

        for surface in &self.config.surfaces {
            self.notifier.request_reload(*surface);
        }
        info!(files, "Widget snapshot exported");
        self.feed.publish(CacheEvent::WidgetExported { files, at: now });
        Ok(snapshot)
    }

    /// Read back the current snapshot. A corrupt file is deleted.
    pub async fn read_snapshot(&self) -> Result<Option<WidgetSnapshot>> {
        let path = self.directory.join(SNAPSHOT_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.counters.record_miss(MissReason::NotFound);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => {
                self.counters.record_hit();
                Ok(Some(snapshot))
            }
            Err(e) => {
                warn!(error = %e, "Corrupt widget snapshot deleted");
                self.counters.record_miss(MissReason::Corrupt);
                remove_if_exists(&path).await?;
                Ok(None)
            }
        }
    }

    /// Load `index.json` from disk. Returns the number of indexed files.
    pub async fn preload(&self) -> Result<usize> {
        let path = self.directory.join(INDEX_FILE);
        let index = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<WidgetIndex>(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Widget index corrupt, starting empty");
                self.counters.record_miss(MissReason::Corrupt);
                WidgetIndex::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => WidgetIndex::default(),
            Err(e) => return Err(e.into()),
        };
        let count = index.files.len();
        *self.index.write() = index;
        Ok(count)
    }

    /// Delete files older than the retention window and files the index
    /// does not know. Returns the number of files removed.
    #[instrument(skip(self))]
    pub async fn purge_stale(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let cutoff = self.clock.now() - to_chrono(self.config.retention);
        let mut index = self.index.read().clone();

        index.files.retain(|_, entry| entry.written_at > cutoff);

        let mut removed = 0u64;
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == INDEX_FILE || index.files.contains_key(&name) {
                continue;
            }
            if entry.file_type().await?.is_file() {
                debug!(file = %name, "Purging widget file");
                remove_if_exists(&entry.path()).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            self.write_index(&index).await?;
            self.counters.record_evictions(removed);
        }
        *self.index.write() = index;
        Ok(removed)
    }

    /// Run `purge_stale` every configured interval until cancelled
    pub fn spawn_purger(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        spawn_periodic("widget-purger", self.config.purge_interval, token, move || {
            let cache = Arc::clone(&cache);
            async move { cache.purge_stale().await.map(|_| ()) }
        })
    }

    /// Delete every exported file and tell the surfaces
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                remove_if_exists(&entry.path()).await?;
            }
        }
        *self.index.write() = WidgetIndex::default();
        for surface in &self.config.surfaces {
            self.notifier.request_reload(*surface);
        }
        self.feed.publish(CacheEvent::Cleared {
            component: "widget".to_string(),
        });
        Ok(())
    }

    /// True if the directory can be written
    pub async fn probe(&self) -> bool {
        let path = self.directory.join(".probe");
        let ok = tokio::fs::write(&path, b"ok").await.is_ok();
        let _ = tokio::fs::remove_file(&path).await;
        ok
    }

    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.directory.join(name);
        let tmp = self.directory.join(format!("{}.tmp", name));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn write_index(&self, index: &WidgetIndex) -> Result<()> {
        let raw = serde_json::to_vec_pretty(index)?;
        self.write_atomic(INDEX_FILE, &raw).await
    }

    pub fn metrics(&self) -> ComponentMetrics {
        let index = self.index.read();
        self.counters
            .snapshot(index.files.len() as u64, index.size_bytes())
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.feed.subscribe()
    }
}

fn sanitize(slot: &str) -> String {
    slot.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
