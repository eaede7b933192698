//! Memory Tier - RAM-based Image Projection
//!
//! An `lru::LruCache` bounded by aggregate bytes rather than entry count.
//! Every insert pops least-recently-used blobs until the tier is back under
//! its byte cap, so the cap holds after each `put`.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use super::ImageBlob;

/// Memory tier
pub struct MemoryTier {
    entries: Mutex<LruCache<String, ImageBlob>>,
    capacity: u64,
    current_size: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity,
            current_size: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get a blob and mark it most recently used
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<ImageBlob> {
        let mut entries = self.entries.lock();
        let blob = entries.get_mut(key)?;
        blob.last_access = now;
        Some(blob.clone())
    }

    /// Insert a blob. Returns the number of blobs evicted, or `None` if the
    /// blob alone exceeds the tier's capacity and was refused.
    pub fn put(&self, blob: ImageBlob) -> Option<usize> {
        if blob.size_bytes > self.capacity {
            return None;
        }

        let mut entries = self.entries.lock();
        let size = blob.size_bytes;
        if let Some(old) = entries.put(blob.url_hash.clone(), blob) {
            self.current_size.fetch_sub(old.size_bytes, Ordering::Relaxed);
        }
        self.current_size.fetch_add(size, Ordering::Relaxed);

        let mut evicted = 0;
        while self.current_size.load(Ordering::Relaxed) > self.capacity {
            match entries.pop_lru() {
                Some((_, victim)) => {
                    self.current_size
                        .fetch_sub(victim.size_bytes, Ordering::Relaxed);
                    evicted += 1;
                }
                None => break,
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        Some(evicted)
    }

    /// Remove a blob
    pub fn remove(&self, key: &str) -> Option<ImageBlob> {
        let removed = self.entries.lock().pop(key)?;
        self.current_size
            .fetch_sub(removed.size_bytes, Ordering::Relaxed);
        Some(removed)
    }

    /// Drop every blob
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        self.current_size.store(0, Ordering::Relaxed);
    }

    /// Get current size in bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
