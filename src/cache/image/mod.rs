//! Image Cache
//!
//! Two-level binary blob cache keyed by content URL.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         ImageCache                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Memory Tier                                                     │
//! │  └── LRU by aggregate bytes, disposable projection               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Disk Tier (authoritative)                                       │
//! │  └── one file per URL hash, 7-day TTL, evicts to 80% of cap      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `put` lands in memory synchronously and schedules the disk write on a
//! task tracker, so a `get` right after a `put` is always a memory hit.

mod disk;
mod memory;

pub use disk::{DiskLookup, DiskTier, WriteOutcome};
pub use memory::MemoryTier;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use crate::cache::metrics::{CacheCounters, ComponentMetrics, MissReason};
use crate::cache::ttl::{secs, to_chrono, SizeBudget};
use crate::clock::Clock;
use crate::domain::{CacheEvent, ChangeFeed};
use crate::error::Result;

/// Default memory tier capacity (50 MiB)
pub const DEFAULT_MEMORY_CAPACITY: u64 = 50 * 1024 * 1024;

/// Default disk tier capacity (200 MiB)
pub const DEFAULT_DISK_CAPACITY: u64 = 200 * 1024 * 1024;

/// Stable 128-bit key for a URL, rendered as 32 hex characters.
///
/// Two FxHash passes with different seeds; non-cryptographic, but stable
/// across processes and filesystem-safe.
pub fn url_key(url: &str) -> String {
    #[inline]
    fn fx_hash(bytes: &[u8], seed: u64) -> u64 {
        const MUL: u64 = 0x517cc1b727220a95;
        let mut hash = seed;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(MUL);
        }
        hash
    }

    let hi = fx_hash(url.as_bytes(), 0x517cc1b727220a95);
    let lo = fx_hash(url.as_bytes(), 0x9e3779b97f4a7c15);
    format!("{:016x}{:016x}", hi, lo)
}

/// A cached image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBlob {
    /// Hash of the source URL
    pub url_hash: String,
    pub bytes: Bytes,
    pub size_bytes: u64,
    pub cached_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

impl ImageBlob {
    pub fn new(url_hash: String, bytes: Bytes, cached_at: DateTime<Utc>) -> Self {
        Self {
            url_hash,
            size_bytes: bytes.len() as u64,
            bytes,
            cached_at,
            last_access: cached_at,
        }
    }
}

/// Image cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    /// Directory owned by the disk tier
    pub directory: PathBuf,
    /// Memory tier cap in bytes
    pub memory_capacity_bytes: u64,
    /// Disk tier cap in bytes
    pub disk_capacity_bytes: u64,
    /// Fraction of the disk cap an eviction pass reduces usage to
    pub disk_low_watermark: f64,
    /// Age after which a blob is expired on both tiers
    #[serde(with = "secs")]
    pub ttl: Duration,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("images"),
            memory_capacity_bytes: DEFAULT_MEMORY_CAPACITY,
            disk_capacity_bytes: DEFAULT_DISK_CAPACITY,
            disk_low_watermark: 0.80,
            ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Image cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageCacheStats {
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub memory_capacity: u64,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub disk_capacity: u64,
}

/// Two-level image cache
pub struct ImageCache {
    memory: MemoryTier,
    disk: Arc<DiskTier>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    writes: TaskTracker,
    counters: Arc<CacheCounters>,
    feed: ChangeFeed,
}

impl ImageCache {
    pub fn new(config: &ImageCacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let budget =
            SizeBudget::with_low_watermark(config.disk_capacity_bytes, config.disk_low_watermark);
        Ok(Self {
            memory: MemoryTier::new(config.memory_capacity_bytes),
            disk: Arc::new(DiskTier::new(&config.directory, budget, config.ttl)?),
            ttl: config.ttl,
            clock,
            writes: TaskTracker::new(),
            counters: Arc::new(CacheCounters::new()),
            feed: ChangeFeed::default(),
        })
    }

    fn is_expired(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now >= cached_at + to_chrono(self.ttl)
    }

    /// Look up an image: memory first, then disk (re-populating memory)
    #[instrument(skip(self))]
    pub async fn get(&self, url: &str) -> Option<ImageBlob> {
        let key = url_key(url);
        let now = self.clock.now();

        if let Some(blob) = self.memory.get(&key, now) {
            if !self.is_expired(blob.cached_at, now) {
                debug!("Image memory hit");
                self.counters.record_hit();
                return Some(blob);
            }
            self.memory.remove(&key);
        }

        match self.disk.read(&key, now).await {
            Ok(DiskLookup::Hit { bytes, cached_at }) => {
                debug!("Image disk hit");
                self.counters.record_hit();
                let mut blob = ImageBlob::new(key, bytes, cached_at);
                blob.last_access = now;
                self.admit_to_memory(blob.clone());
                Some(blob)
            }
            Ok(DiskLookup::Expired) => {
                self.counters.record_miss(MissReason::Expired);
                None
            }
            Ok(DiskLookup::Missing) => {
                self.counters.record_miss(MissReason::NotFound);
                None
            }
            Err(e) => {
                warn!(error = %e, "Unreadable disk image, deleting");
                self.counters.record_storage_failure();
                self.counters.record_miss(MissReason::Corrupt);
                if let Err(e) = self.disk.remove(&key).await {
                    warn!(error = %e, "Failed to delete unreadable disk image");
                }
                None
            }
        }
    }

    /// Store an image. Memory is written before returning; the disk write
    /// runs in the background (see [`ImageCache::flush`]).
    ///
    /// Outside a tokio runtime the blob is cached in memory only.
    pub fn put(&self, url: &str, bytes: Bytes) {
        let key = url_key(url);
        let now = self.clock.now();
        let blob = ImageBlob::new(key.clone(), bytes.clone(), now);
        let size_bytes = blob.size_bytes;

        self.counters.record_write();
        self.admit_to_memory(blob);
        self.feed.publish(CacheEvent::ImageStored {
            url_hash: key.clone(),
            size_bytes,
        });

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, image cached in memory only");
            return;
        };

        let disk = Arc::clone(&self.disk);
        let counters = Arc::clone(&self.counters);
        let feed = self.feed.clone();
        let generation = disk.generation();
        self.writes.spawn_on(
            async move {
                match disk.write(&key, bytes, now, generation).await {
                    Ok(WriteOutcome::Written { evicted }) if evicted > 0 => {
                        counters.record_evictions(evicted as u64);
                        feed.publish(CacheEvent::ImagesEvicted {
                            tier: "disk".to_string(),
                            count: evicted,
                        });
                    }
                    Ok(WriteOutcome::Refused) => {
                        debug!(size_bytes, "Image larger than disk capacity, memory only");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Disk image write failed, memory only");
                        counters.record_storage_failure();
                    }
                }
            },
            &handle,
        );
    }

    fn admit_to_memory(&self, blob: ImageBlob) {
        match self.memory.put(blob) {
            Some(0) => {}
            Some(evicted) => {
                self.counters.record_evictions(evicted as u64);
                self.feed.publish(CacheEvent::ImagesEvicted {
                    tier: "memory".to_string(),
                    count: evicted,
                });
            }
            None => debug!("Image larger than memory capacity, disk only"),
        }
    }

    /// Drop one image from both tiers
    pub async fn invalidate(&self, url: &str) -> Result<()> {
        let key = url_key(url);
        self.memory.remove(&key);
        self.disk.remove(&key).await?;
        Ok(())
    }

    /// Drop every image. Disk writes still pending are discarded.
    pub async fn clear(&self) -> Result<()> {
        self.memory.clear();
        let removed = self.disk.clear().await?;
        debug!(removed, "Image cache cleared");
        self.feed.publish(CacheEvent::Cleared {
            component: "image".to_string(),
        });
        Ok(())
    }

    /// Drop the memory tier only
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Wait for every scheduled disk write
    pub async fn flush(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    /// Rebuild the disk index from the directory
    pub async fn preload(&self) -> Result<usize> {
        let indexed = self.disk.preload().await?;
        debug!(indexed, "Image disk index rebuilt");
        Ok(indexed)
    }

    /// Expire and evict on disk outside of the write path
    pub async fn cleanup_disk(&self) -> Result<usize> {
        let removed = self.disk.cleanup(self.clock.now()).await?;
        if removed > 0 {
            self.counters.record_evictions(removed as u64);
        }
        Ok(removed)
    }

    pub fn stats(&self) -> ImageCacheStats {
        ImageCacheStats {
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.size(),
            memory_capacity: self.memory.capacity(),
            disk_entries: self.disk.len(),
            disk_bytes: self.disk.size(),
            disk_capacity: self.disk.capacity(),
        }
    }

    pub fn metrics(&self) -> ComponentMetrics {
        self.counters
            .snapshot(self.disk.len() as u64, self.disk.size())
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    /// Writes scheduled but not yet finished
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.feed.subscribe()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn make_cache(dir: &std::path::Path, memory: u64, disk: u64) -> (ImageCache, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let config = ImageCacheConfig {
            directory: dir.to_path_buf(),
            memory_capacity_bytes: memory,
            disk_capacity_bytes: disk,
            ..Default::default()
        };
        let cache = ImageCache::new(&config, clock.clone()).unwrap();
        (cache, clock)
    }

    #[test]
    fn test_url_key_is_stable_and_safe() {
        let a = url_key("https://cdn.example.com/a.jpg?w=100");
        assert_eq!(a, url_key("https://cdn.example.com/a.jpg?w=100"));
        assert_ne!(a, url_key("https://cdn.example.com/b.jpg?w=100"));
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_put_then_get_before_disk_write() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _clock) = make_cache(dir.path(), 1024, 4096);

        cache.put("a.jpg", Bytes::from_static(b"jpeg-bytes"));
        let blob = cache.get("a.jpg").await.unwrap();
        assert_eq!(blob.bytes, Bytes::from_static(b"jpeg-bytes"));
        assert_eq!(cache.counters().hits(), 1);
    }

    #[tokio::test]
    async fn test_disk_hit_repopulates_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _clock) = make_cache(dir.path(), 1024, 4096);

        cache.put("a.jpg", Bytes::from_static(b"abc"));
        cache.flush().await;
        cache.clear_memory();
        assert_eq!(cache.stats().memory_entries, 0);

        assert!(cache.get("a.jpg").await.is_some());
        assert_eq!(cache.stats().memory_entries, 1);
        assert_eq!(cache.stats().disk_entries, 1);
    }

    #[tokio::test]
    async fn test_expired_on_disk_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, clock) = make_cache(dir.path(), 1024, 4096);

        cache.put("a.jpg", Bytes::from_static(b"abc"));
        cache.flush().await;
        cache.clear_memory();

        clock.advance(chrono::Duration::days(8));
        assert!(cache.get("a.jpg").await.is_none());
        assert_eq!(cache.stats().disk_entries, 0);
        assert_eq!(cache.metrics().misses_expired, 1);
    }

    #[tokio::test]
    async fn test_clear_discards_pending_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _clock) = make_cache(dir.path(), 1024, 4096);

        for i in 0..10 {
            cache.put(&format!("img-{}", i), Bytes::from(vec![1u8; 64]));
        }
        cache.clear().await.unwrap();
        cache.flush().await;

        assert_eq!(cache.stats().disk_entries, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(cache.get("img-3").await.is_none());
    }

    #[tokio::test]
    async fn test_budgets_hold_after_puts() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _clock) = make_cache(dir.path(), 300, 1000);

        for i in 0..30 {
            cache.put(&format!("img-{}", i), Bytes::from(vec![0u8; 100]));
            assert!(cache.stats().memory_bytes <= 300);
        }
        cache.flush().await;
        let stats = cache.stats();
        assert!(stats.disk_bytes <= 1000);
        assert!(cache.metrics().evictions > 0);
    }

    #[tokio::test]
    async fn test_invalidate_removes_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _clock) = make_cache(dir.path(), 1024, 4096);

        cache.put("a.jpg", Bytes::from_static(b"abc"));
        cache.flush().await;
        cache.invalidate("a.jpg").await.unwrap();

        assert!(cache.get("a.jpg").await.is_none());
        assert_eq!(cache.metrics().misses_not_found, 1);
    }

    #[tokio::test]
    async fn test_preload_picks_up_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (cache, _clock) = make_cache(dir.path(), 1024, 4096);
            cache.put("a.jpg", Bytes::from_static(b"abc"));
            cache.flush().await;
        }

        let (cache, _clock) = make_cache(dir.path(), 1024, 4096);
        assert_eq!(cache.preload().await.unwrap(), 1);
        assert!(cache.get("a.jpg").await.is_some());
    }
}
