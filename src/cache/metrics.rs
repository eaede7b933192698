//! Cache Metrics Collection
//!
//! Lock-free per-component counters, rolled up by the orchestrator into
//! [`ComponentMetrics`] snapshots and exposed in Prometheus text format.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Why a read returned nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NotFound,
    Expired,
    /// Undecodable record, deleted on read
    Corrupt,
}

/// Per-component counters
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses_not_found: AtomicU64,
    misses_expired: AtomicU64,
    misses_corrupt: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    remote_calls: AtomicU64,
    storage_failures: AtomicU64,
    remote_failures: AtomicU64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, reason: MissReason) {
        let counter = match reason {
            MissReason::NotFound => &self.misses_not_found,
            MissReason::Expired => &self.misses_expired,
            MissReason::Corrupt => &self.misses_corrupt,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_remote_call(&self) {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_failure(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_failure(&self) {
        self.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses_not_found.load(Ordering::Relaxed)
            + self.misses_expired.load(Ordering::Relaxed)
            + self.misses_corrupt.load(Ordering::Relaxed)
    }

    pub fn remote_calls(&self) -> u64 {
        self.remote_calls.load(Ordering::Relaxed)
    }

    pub fn storage_failures(&self) -> u64 {
        self.storage_failures.load(Ordering::Relaxed)
    }

    pub fn remote_failures(&self) -> u64 {
        self.remote_failures.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Snapshot with the component's current size gauges
    pub fn snapshot(&self, entries: u64, size_bytes: u64) -> ComponentMetrics {
        ComponentMetrics {
            hits: self.hits(),
            misses_not_found: self.misses_not_found.load(Ordering::Relaxed),
            misses_expired: self.misses_expired.load(Ordering::Relaxed),
            misses_corrupt: self.misses_corrupt.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            remote_calls: self.remote_calls(),
            storage_failures: self.storage_failures(),
            remote_failures: self.remote_failures(),
            hit_ratio: self.hit_ratio(),
            entries,
            size_bytes,
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses_not_found,
            &self.misses_expired,
            &self.misses_corrupt,
            &self.writes,
            &self.evictions,
            &self.remote_calls,
            &self.storage_failures,
            &self.remote_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time metrics of one component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetrics {
    pub hits: u64,
    pub misses_not_found: u64,
    pub misses_expired: u64,
    pub misses_corrupt: u64,
    pub writes: u64,
    pub evictions: u64,
    pub remote_calls: u64,
    pub storage_failures: u64,
    pub remote_failures: u64,
    pub hit_ratio: f64,
    pub entries: u64,
    pub size_bytes: u64,
}

impl ComponentMetrics {
    /// Any failure recorded since the last reset
    pub fn has_failures(&self) -> bool {
        self.storage_failures > 0 || self.remote_failures > 0
    }
}

/// Render component metrics in Prometheus text exposition format
pub fn render_prometheus(metrics: &BTreeMap<String, ComponentMetrics>) -> Result<String> {
    let registry = Registry::new_custom(Some("pairsync".to_string()), None)
        .map_err(|e| Error::Internal(format!("metrics registry: {}", e)))?;

    let gauge = |name: &str, help: &str| -> Result<IntGaugeVec> {
        let vec = IntGaugeVec::new(Opts::new(name, help), &["component"])
            .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
        registry
            .register(Box::new(vec.clone()))
            .map_err(|e| Error::Internal(format!("metric {}: {}", name, e)))?;
        Ok(vec)
    };

    let hits = gauge("cache_hits", "Cache hits")?;
    let misses = IntGaugeVec::new(
        Opts::new("cache_misses", "Cache misses by reason"),
        &["component", "reason"],
    )
    .map_err(|e| Error::Internal(format!("metric cache_misses: {}", e)))?;
    registry
        .register(Box::new(misses.clone()))
        .map_err(|e| Error::Internal(format!("metric cache_misses: {}", e)))?;
    let writes = gauge("cache_writes", "Cache writes")?;
    let evictions = gauge("cache_evictions", "Entries evicted to satisfy budgets")?;
    let remote_calls = gauge("cache_remote_calls", "Remote calls issued")?;
    let failures = IntGaugeVec::new(
        Opts::new("cache_failures", "Recorded failures by kind"),
        &["component", "kind"],
    )
    .map_err(|e| Error::Internal(format!("metric cache_failures: {}", e)))?;
    registry
        .register(Box::new(failures.clone()))
        .map_err(|e| Error::Internal(format!("metric cache_failures: {}", e)))?;
    let entries = gauge("cache_entries", "Entries currently cached")?;
    let size = gauge("cache_size_bytes", "Bytes currently cached")?;

    for (component, m) in metrics {
        let c = component.as_str();
        hits.with_label_values(&[c]).set(m.hits as i64);
        misses
            .with_label_values(&[c, "not_found"])
            .set(m.misses_not_found as i64);
        misses
            .with_label_values(&[c, "expired"])
            .set(m.misses_expired as i64);
        misses
            .with_label_values(&[c, "corrupt"])
            .set(m.misses_corrupt as i64);
        writes.with_label_values(&[c]).set(m.writes as i64);
        evictions.with_label_values(&[c]).set(m.evictions as i64);
        remote_calls.with_label_values(&[c]).set(m.remote_calls as i64);
        failures
            .with_label_values(&[c, "storage"])
            .set(m.storage_failures as i64);
        failures
            .with_label_values(&[c, "remote"])
            .set(m.remote_failures as i64);
        entries.with_label_values(&[c]).set(m.entries as i64);
        size.with_label_values(&[c]).set(m.size_bytes as i64);
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
}

// =============================================================================
// Tests
// =============================================================================
