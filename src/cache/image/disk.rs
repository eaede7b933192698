//! Disk Tier - Authoritative Image Store
//!
//! One file per blob, named by the URL hash, in a directory owned by this
//! tier. An in-memory index of `(size, cached_at, access stamp)` is rebuilt
//! from the directory listing by [`DiskTier::preload`].
//!
//! # Design
//!
//! - Writes go to a temp file and are renamed into place
//! - Each write first evicts least-recently-used files until usage plus the
//!   incoming blob is at or below the low watermark
//! - A generation counter is checked under the write lock, so a `clear()`
//!   issued while writes are pending keeps them from landing

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::ttl::{select_eviction_victims, to_chrono, EvictionCandidate, SizeBudget};
use crate::error::Result;

const BLOB_EXTENSION: &str = "img";

#[derive(Debug, Clone, Copy)]
struct DiskEntry {
    size_bytes: u64,
    cached_at: DateTime<Utc>,
    last_access: u64,
}

/// Outcome of a disk lookup
#[derive(Debug)]
pub enum DiskLookup {
    Hit { bytes: Bytes, cached_at: DateTime<Utc> },
    Expired,
    Missing,
}

/// Outcome of a disk write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { evicted: usize },
    /// Blob larger than the disk capacity
    Refused,
    /// A clear happened after the write was scheduled, or the disk already
    /// holds a newer copy of the key
    Superseded,
}

/// Disk tier
pub struct DiskTier {
    dir: PathBuf,
    budget: SizeBudget,
    ttl: Duration,
    index: Mutex<HashMap<String, DiskEntry>>,
    current_size: AtomicU64,
    access_seq: AtomicU64,
    generation: AtomicU64,
    /// Serializes writes, evictions, and clears on the directory
    write_lock: tokio::sync::Mutex<()>,
    evictions: AtomicU64,
}

impl DiskTier {
    /// Create the tier, creating its directory if needed
    pub fn new(dir: impl Into<PathBuf>, budget: SizeBudget, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            budget,
            ttl,
            index: Mutex::new(HashMap::new()),
            current_size: AtomicU64::new(0),
            access_seq: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            write_lock: tokio::sync::Mutex::new(()),
            evictions: AtomicU64::new(0),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, BLOB_EXTENSION))
    }

    fn next_access(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_expired(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now >= cached_at + to_chrono(self.ttl)
    }

    /// Current generation; captured when a write is scheduled
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Read a blob
    pub async fn read(&self, key: &str, now: DateTime<Utc>) -> Result<DiskLookup> {
        let entry = self.index.lock().get(key).copied();
        let Some(entry) = entry else {
            return Ok(DiskLookup::Missing);
        };

        if self.is_expired(entry.cached_at, now) {
            debug!(key, "Disk entry expired");
            self.remove(key).await?;
            return Ok(DiskLookup::Expired);
        }

        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => {
                if let Some(e) = self.index.lock().get_mut(key) {
                    e.last_access = self.next_access();
                }
                Ok(DiskLookup::Hit {
                    bytes: Bytes::from(bytes),
                    cached_at: entry.cached_at,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.forget(key);
                Ok(DiskLookup::Missing)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a blob scheduled under `generation`
    pub async fn write(
        &self,
        key: &str,
        bytes: Bytes,
        cached_at: DateTime<Utc>,
        generation: u64,
    ) -> Result<WriteOutcome> {
        let size = bytes.len() as u64;
        if !self.budget.fits(size) {
            return Ok(WriteOutcome::Refused);
        }

        let _guard = self.write_lock.lock().await;
        if self.generation() != generation {
            debug!(key, "Dropping disk write scheduled before clear");
            return Ok(WriteOutcome::Superseded);
        }
        if self
            .index
            .lock()
            .get(key)
            .is_some_and(|e| e.cached_at > cached_at)
        {
            debug!(key, "Disk already holds a newer copy");
            return Ok(WriteOutcome::Superseded);
        }

        // A replaced blob's bytes do not count against the incoming one
        let replaced = self.index.lock().get(key).map(|e| e.size_bytes).unwrap_or(0);
        let current = self.size().saturating_sub(replaced);
        let evicted = self.evict_locked(current, size, Some(key)).await?;

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let entry = DiskEntry {
            size_bytes: size,
            cached_at,
            last_access: self.next_access(),
        };
        if let Some(old) = self.index.lock().insert(key.to_string(), entry) {
            self.current_size
                .fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.current_size.fetch_add(size, Ordering::Relaxed);
        Ok(WriteOutcome::Written { evicted })
    }

    /// Evict LRU files to admit `incoming` bytes. Caller holds the write lock.
    async fn evict_locked(&self, current: u64, incoming: u64, keep: Option<&str>) -> Result<usize> {
        let to_free = self.budget.bytes_to_free(current, incoming);
        if to_free == 0 {
            return Ok(0);
        }

        let candidates: Vec<EvictionCandidate<String>> = self
            .index
            .lock()
            .iter()
            .filter(|(k, _)| Some(k.as_str()) != keep)
            .map(|(k, e)| EvictionCandidate {
                key: k.clone(),
                size_bytes: e.size_bytes,
                last_access: e.last_access,
            })
            .collect();

        let victims = select_eviction_victims(&candidates, to_free);
        for victim in &victims {
            self.delete_file(victim).await?;
            self.forget(victim);
        }
        self.evictions
            .fetch_add(victims.len() as u64, Ordering::Relaxed);
        if !victims.is_empty() {
            debug!(count = victims.len(), freed_target = to_free, "Evicted disk blobs");
        }
        Ok(victims.len())
    }

    /// Delete expired files, then evict down to the low watermark if the
    /// directory is over its cap. Returns the number of files removed.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let expired: Vec<String> = self
            .index
            .lock()
            .iter()
            .filter(|(_, e)| self.is_expired(e.cached_at, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.delete_file(key).await?;
            self.forget(key);
        }

        let evicted = self.evict_locked(self.size(), 0, None).await?;
        Ok(expired.len() + evicted)
    }

    /// Remove one blob
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let existed = self.forget(key);
        self.delete_file(key).await?;
        Ok(existed)
    }

    /// Remove every blob and invalidate pending writes
    pub async fn clear(&self) -> Result<usize> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let _guard = self.write_lock.lock().await;

        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if item.file_type().await?.is_file() && remove_path(&item.path()).await? {
                removed += 1;
            }
        }
        self.index.lock().clear();
        self.current_size.store(0, Ordering::Relaxed);
        Ok(removed)
    }

    /// Rebuild the index from the directory listing. Stray temp files are
    /// removed. Returns the number of indexed blobs.
    pub async fn preload(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let mut rebuilt = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let metadata = item.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            match blob_key(&path) {
                Some(key) => {
                    let cached_at = metadata
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now());
                    rebuilt.push((key, metadata.len(), cached_at));
                }
                None => {
                    warn!(path = %path.display(), "Removing stray file from image directory");
                    remove_path(&path).await?;
                }
            }
        }

        // Oldest files get the lowest access stamps
        rebuilt.sort_by_key(|(_, _, cached_at)| *cached_at);
        let mut index = self.index.lock();
        index.clear();
        let mut total = 0;
        for (key, size_bytes, cached_at) in rebuilt {
            total += size_bytes;
            index.insert(
                key,
                DiskEntry {
                    size_bytes,
                    cached_at,
                    last_access: self.next_access(),
                },
            );
        }
        self.current_size.store(total, Ordering::Relaxed);
        Ok(index.len())
    }

    fn forget(&self, key: &str) -> bool {
        match self.index.lock().remove(key) {
            Some(entry) => {
                self.current_size
                    .fetch_sub(entry.size_bytes, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        remove_path(&self.path_for(key)).await.map(|_| ())
    }

    /// Get current size in bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u64 {
        self.budget.capacity
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn blob_key(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

/// Remove a file; returns false if it was already gone
async fn remove_path(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Tests
// =============================================================================
