//! Profile Cache
//!
//! Two independent sub-caches:
//!
//! - the profile record, serialized into the settings store with an absolute
//!   TTL; past the TTL it is deleted and reported as a miss, never served
//! - avatar images keyed by role, stored as files next to a small metadata
//!   entry that remembers the source URL, so a changed photo is detected by
//!   comparing URLs instead of downloading

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::cache::metrics::{CacheCounters, ComponentMetrics, MissReason};
use crate::cache::ttl::{secs, CacheRecord};
use crate::clock::Clock;
use crate::domain::ports::{BlobStore, SettingsStore};
use crate::domain::{CacheEvent, ChangeFeed};
use crate::error::Result;

const RECORD_KEY: &str = "profile.record";
const AVATAR_KEY_PREFIX: &str = "profile.avatar.";
const KEY_PREFIX: &str = "profile.";

/// Whose avatar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarRole {
    User,
    Partner,
}

impl AvatarRole {
    pub const ALL: [AvatarRole; 2] = [AvatarRole::User, AvatarRole::Partner];

    pub fn as_str(&self) -> &'static str {
        match self {
            AvatarRole::User => "user",
            AvatarRole::Partner => "partner",
        }
    }

    fn settings_key(&self) -> String {
        format!("{}{}", AVATAR_KEY_PREFIX, self.as_str())
    }

    fn index(&self) -> usize {
        match self {
            AvatarRole::User => 0,
            AvatarRole::Partner => 1,
        }
    }
}

impl fmt::Display for AvatarRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached profile fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub partner_id: Option<String>,
    #[serde(default)]
    pub pairing_id: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub partner_avatar_url: Option<String>,
    /// Remaining profile fields, passed through untouched
    #[serde(default)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AvatarMeta {
    source_url: String,
    cached_at: DateTime<Utc>,
    size_bytes: u64,
}

/// A cached avatar image
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAvatar {
    pub role: AvatarRole,
    pub source_url: String,
    pub bytes: Bytes,
    pub cached_at: DateTime<Utc>,
}

/// Profile cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileCacheConfig {
    /// Absolute TTL of the profile record
    #[serde(with = "secs")]
    pub ttl: Duration,
    /// Directory holding avatar files
    pub avatar_directory: PathBuf,
}

impl Default for ProfileCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 3600),
            avatar_directory: PathBuf::from("avatars"),
        }
    }
}

/// Profile record and avatar cache
pub struct ProfileCache {
    settings: Arc<dyn SettingsStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: ProfileCacheConfig,
    counters: CacheCounters,
    feed: ChangeFeed,
    /// One writer per role keeps each file and its metadata entry paired
    avatar_locks: [tokio::sync::Mutex<()>; 2],
}

impl ProfileCache {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        config: ProfileCacheConfig,
    ) -> Self {
        Self {
            settings,
            blobs,
            clock,
            config,
            counters: CacheCounters::new(),
            feed: ChangeFeed::default(),
            avatar_locks: [tokio::sync::Mutex::new(()), tokio::sync::Mutex::new(())],
        }
    }

    // =========================================================================
    // Profile record
    // =========================================================================

    /// Cache the profile record, restarting its TTL
    pub async fn put(&self, record: ProfileRecord) -> Result<()> {
        let envelope = CacheRecord::new(RECORD_KEY.to_string(), record, self.clock.now(), self.config.ttl);
        self.settings
            .put(RECORD_KEY, serde_json::to_string(&envelope)?)
            .await?;
        self.counters.record_write();
        self.feed.publish(CacheEvent::ProfileChanged { present: true });
        Ok(())
    }

    /// The cached profile, or `None` if missing, expired, or undecodable.
    /// Expired and undecodable records are deleted.
    #[instrument(skip(self))]
    pub async fn get(&self) -> Option<ProfileRecord> {
        let raw = match self.settings.get(RECORD_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.counters.record_miss(MissReason::NotFound);
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Profile read failed");
                self.counters.record_storage_failure();
                return None;
            }
        };

        let envelope: CacheRecord<String, ProfileRecord> = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Corrupt profile record, deleting");
                self.counters.record_miss(MissReason::Corrupt);
                self.remove_key(RECORD_KEY).await;
                return None;
            }
        };

        if !envelope.is_valid(self.clock.now()) {
            debug!(cached_at = %envelope.cached_at, "Profile record expired, deleting");
            self.counters.record_miss(MissReason::Expired);
            self.remove_key(RECORD_KEY).await;
            self.feed.publish(CacheEvent::ProfileChanged { present: false });
            return None;
        }

        self.counters.record_hit();
        Some(envelope.value)
    }

    /// Drop the profile record
    pub async fn invalidate_profile(&self) -> Result<()> {
        self.settings.remove(RECORD_KEY).await?;
        self.feed.publish(CacheEvent::ProfileChanged { present: false });
        Ok(())
    }

    async fn remove_key(&self, key: &str) {
        if let Err(e) = self.settings.remove(key).await {
            warn!(key, error = %e, "Failed to delete profile entry");
            self.counters.record_storage_failure();
        }
    }

    // =========================================================================
    // Avatars
    // =========================================================================

    fn avatar_path(&self, role: AvatarRole) -> PathBuf {
        self.config
            .avatar_directory
            .join(format!("avatar_{}.img", role.as_str()))
    }

    async fn avatar_meta(&self, role: AvatarRole) -> Option<AvatarMeta> {
        let raw = match self.settings.get(&role.settings_key()).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(role = %role, error = %e, "Avatar metadata read failed");
                self.counters.record_storage_failure();
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(role = %role, error = %e, "Corrupt avatar metadata, deleting");
                self.counters.record_miss(MissReason::Corrupt);
                self.remove_key(&role.settings_key()).await;
                None
            }
        }
    }

    /// Store avatar bytes fetched from `source_url`
    /// If the metadata write fails the new file is discarded, leaving the
    /// role uncached instead of serving bytes under the previous URL.
    pub async fn put_avatar(&self, role: AvatarRole, source_url: &str, bytes: Bytes) -> Result<()> {
        let meta = AvatarMeta {
            source_url: source_url.to_string(),
            cached_at: self.clock.now(),
            size_bytes: bytes.len() as u64,
        };
        let encoded = serde_json::to_string(&meta)?;
        let key = role.settings_key();

        let _guard = self.avatar_locks[role.index()].lock().await;
        tokio::fs::create_dir_all(&self.config.avatar_directory).await?;
        let path = self.avatar_path(role);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        if let Err(e) = self.settings.put(&key, encoded).await {
            warn!(role = %role, error = %e, "Avatar metadata write failed, discarding file");
            self.counters.record_storage_failure();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(role = %role, error = %err, "Failed to discard avatar file"),
            }
            self.remove_key(&key).await;
            return Err(e);
        }

        self.counters.record_write();
        self.feed.publish(CacheEvent::AvatarChanged {
            role: role.to_string(),
            source_url: Some(source_url.to_string()),
        });
        Ok(())
    }

    /// The cached avatar for `role`
    #[instrument(skip(self))]
    pub async fn get_avatar(&self, role: AvatarRole) -> Option<CachedAvatar> {
        let Some(meta) = self.avatar_meta(role).await else {
            self.counters.record_miss(MissReason::NotFound);
            return None;
        };

        match tokio::fs::read(self.avatar_path(role)).await {
            Ok(bytes) => {
                self.counters.record_hit();
                Some(CachedAvatar {
                    role,
                    source_url: meta.source_url,
                    bytes: Bytes::from(bytes),
                    cached_at: meta.cached_at,
                })
            }
            Err(e) => {
                // Metadata without a file is useless; drop it so the next
                // refresh downloads again
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(role = %role, error = %e, "Avatar file unreadable");
                    self.counters.record_storage_failure();
                }
                self.counters.record_miss(MissReason::NotFound);
                self.remove_key(&role.settings_key()).await;
                None
            }
        }
    }

    /// True if no avatar is cached for `role` or it came from another URL
    pub async fn avatar_needs_refresh(&self, role: AvatarRole, url: &str) -> bool {
        match self.avatar_meta(role).await {
            Some(meta) => meta.source_url != url,
            None => true,
        }
    }

    /// Download the avatar when its URL changed. Returns whether a download
    /// happened.
    #[instrument(skip(self))]
    pub async fn refresh_avatar(&self, role: AvatarRole, url: &str) -> Result<bool> {
        if !self.avatar_needs_refresh(role, url).await {
            debug!("Avatar URL unchanged, skipping download");
            return Ok(false);
        }

        self.counters.record_remote_call();
        let bytes = self
            .blobs
            .download(url)
            .await
            .inspect_err(|_| self.counters.record_remote_failure())?;
        self.put_avatar(role, url, bytes).await?;
        Ok(true)
    }

    /// Drop one avatar
    pub async fn invalidate_avatar(&self, role: AvatarRole) -> Result<()> {
        let _guard = self.avatar_locks[role.index()].lock().await;
        self.settings.remove(&role.settings_key()).await?;
        match tokio::fs::remove_file(self.avatar_path(role)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.feed.publish(CacheEvent::AvatarChanged {
            role: role.to_string(),
            source_url: None,
        });
        Ok(())
    }

    /// Drop the record and both avatars
    pub async fn clear(&self) -> Result<()> {
        self.settings.remove_prefix(KEY_PREFIX).await?;
        for role in AvatarRole::ALL {
            match tokio::fs::remove_file(self.avatar_path(role)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.feed.publish(CacheEvent::Cleared {
            component: "profile".to_string(),
        });
        Ok(())
    }

    pub async fn metrics(&self) -> ComponentMetrics {
        let mut entries = 0;
        let mut size_bytes = 0;
        if matches!(self.settings.get(RECORD_KEY).await, Ok(Some(_))) {
            entries += 1;
        }
        for role in AvatarRole::ALL {
            if let Ok(Some(raw)) = self.settings.get(&role.settings_key()).await {
                entries += 1;
                if let Ok(meta) = serde_json::from_str::<AvatarMeta>(&raw) {
                    size_bytes += meta.size_bytes;
                }
            }
        }
        self.counters.snapshot(entries, size_bytes)
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.feed.subscribe()
    }
}

// =============================================================================
// Tests
// =============================================================================
