//! TTL and Eviction Primitives
//!
//! Pure, deterministic policy functions shared by every cache component:
//! record validity, fresh/stale classification, byte budgets, and
//! least-recently-used victim selection. Nothing in here performs I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Convert a std duration into a chrono duration, saturating on overflow
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

// =============================================================================
// Records
// =============================================================================

/// Logical unit stored by any cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord<K, V> {
    /// Record key
    pub key: K,
    /// Cached value
    pub value: V,
    /// When the value was cached
    pub cached_at: DateTime<Utc>,
    /// Hard expiry, derived from `cached_at + ttl`
    pub expires_at: DateTime<Utc>,
}

impl<K, V> CacheRecord<K, V> {
    /// Create a record expiring `ttl` after `cached_at`
    pub fn new(key: K, value: V, cached_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key,
            value,
            cached_at,
            expires_at: cached_at + to_chrono(ttl),
        }
    }

    /// Check validity at `now`
    #[inline]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        is_valid(self, now)
    }

    /// Age of the record at `now` (zero if `now` precedes `cached_at`)
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.cached_at).to_std().unwrap_or_default()
    }
}

/// A record is valid iff `now < expires_at`; the boundary is invalid.
#[inline]
pub fn is_valid<K, V>(record: &CacheRecord<K, V>, now: DateTime<Utc>) -> bool {
    now < record.expires_at
}

// =============================================================================
// Fresh / stale windows
// =============================================================================

/// Classification of a cached value's age
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    /// Serve without a remote check
    Fresh,
    /// Serve, but refresh in the background
    Stale,
    /// Purge; treat as a miss
    Expired,
}

impl Freshness {
    /// True if the value may be returned to a caller
    pub fn is_servable(&self) -> bool {
        matches!(self, Freshness::Fresh | Freshness::Stale)
    }
}

/// Per-cache TTL window pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    /// Reads younger than this are fresh
    #[serde(with = "secs")]
    pub fresh_window: Duration,
    /// Reads younger than this (and not fresh) are stale; older are expired
    #[serde(with = "secs")]
    pub stale_window: Duration,
}

impl TtlPolicy {
    /// Create a policy; `stale_window` is raised to at least `fresh_window`
    pub fn new(fresh_window: Duration, stale_window: Duration) -> Self {
        Self {
            fresh_window,
            stale_window: stale_window.max(fresh_window),
        }
    }

    /// Policy with no stale window: fresh until the TTL, then expired
    pub fn absolute(ttl: Duration) -> Self {
        Self::new(ttl, ttl)
    }

    /// Classify an age
    pub fn classify(&self, age: Duration) -> Freshness {
        if age < self.fresh_window {
            Freshness::Fresh
        } else if age < self.stale_window {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Classify a value cached at `cached_at`, observed at `now`
    pub fn classify_at(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> Freshness {
        self.classify((now - cached_at).to_std().unwrap_or_default())
    }
}

// =============================================================================
// Byte budgets and eviction
// =============================================================================

/// Aggregate byte budget with a low watermark for eviction passes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeBudget {
    /// Hard cap in bytes
    pub capacity: u64,
    /// Fraction of capacity an eviction pass reduces usage to (0.0 - 1.0)
    pub low_watermark: f64,
}

impl SizeBudget {
    /// Budget that evicts only down to the cap
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            low_watermark: 1.0,
        }
    }

    /// Budget that evicts down to `low_watermark * capacity`
    pub fn with_low_watermark(capacity: u64, low_watermark: f64) -> Self {
        Self {
            capacity,
            low_watermark: low_watermark.clamp(0.0, 1.0),
        }
    }

    /// True if a single item of this size can ever fit
    pub fn fits(&self, size: u64) -> bool {
        size <= self.capacity
    }

    /// Bytes to free before admitting `incoming` bytes on top of `current`.
    ///
    /// Zero while the total stays within the cap; otherwise enough to bring
    /// the total down to the low watermark.
    pub fn bytes_to_free(&self, current: u64, incoming: u64) -> u64 {
        let total = current.saturating_add(incoming);
        if total <= self.capacity {
            return 0;
        }
        let target = (self.capacity as f64 * self.low_watermark) as u64;
        total.saturating_sub(target)
    }

    /// Utilization (0.0 - 1.0+)
    pub fn utilization(&self, current: u64) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        current as f64 / self.capacity as f64
    }
}

/// Input to victim selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate<K> {
    /// Entry key
    pub key: K,
    /// Entry size
    pub size_bytes: u64,
    /// Recency stamp; larger is more recent
    pub last_access: u64,
}

/// Choose least-recently-used keys until at least `target_bytes_freed` bytes
/// are covered. Ties on recency are broken by key so the result is
/// deterministic. Returns every key if the target cannot be reached.
pub fn select_eviction_victims<K>(candidates: &[EvictionCandidate<K>], target_bytes_freed: u64) -> Vec<K>
where
    K: Clone + Ord,
{
    if target_bytes_freed == 0 {
        return Vec::new();
    }

    let mut ordered: Vec<&EvictionCandidate<K>> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.last_access.cmp(&b.last_access).then_with(|| a.key.cmp(&b.key)));

    let mut freed = 0u64;
    let mut victims = Vec::new();
    for candidate in ordered {
        if freed >= target_bytes_freed {
            break;
        }
        freed = freed.saturating_add(candidate.size_bytes);
        victims.push(candidate.key.clone());
    }
    victims
}

/// Serde helper: durations as whole seconds
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn candidate(key: &str, size: u64, last_access: u64) -> EvictionCandidate<String> {
        EvictionCandidate {
            key: key.to_string(),
            size_bytes: size,
            last_access,
        }
    }

    #[test]
    fn test_record_boundary_is_invalid() {
        let record = CacheRecord::new("k", 1, t0(), Duration::from_secs(60));
        assert!(record.is_valid(t0()));
        assert!(record.is_valid(t0() + chrono::Duration::seconds(59)));
        assert!(!record.is_valid(t0() + chrono::Duration::seconds(60)));
        assert!(!record.is_valid(t0() + chrono::Duration::days(1)));
    }

    #[test]
    fn test_record_age() {
        let record = CacheRecord::new("k", (), t0(), Duration::from_secs(60));
        assert_eq!(record.age(t0() + chrono::Duration::seconds(5)), Duration::from_secs(5));
        // Clock skew backwards yields zero age, not a panic
        assert_eq!(record.age(t0() - chrono::Duration::seconds(5)), Duration::ZERO);
    }

    #[test]
    fn test_ttl_policy_classification() {
        let policy = TtlPolicy::new(Duration::from_secs(300), Duration::from_secs(3600));
        assert_eq!(policy.classify(Duration::from_secs(10)), Freshness::Fresh);
        assert_eq!(policy.classify(Duration::from_secs(300)), Freshness::Stale);
        assert_eq!(policy.classify(Duration::from_secs(3599)), Freshness::Stale);
        assert_eq!(policy.classify(Duration::from_secs(3600)), Freshness::Expired);
        assert!(Freshness::Stale.is_servable());
        assert!(!Freshness::Expired.is_servable());
    }

    #[test]
    fn test_ttl_policy_absolute_has_no_stale_window() {
        let policy = TtlPolicy::absolute(Duration::from_secs(60));
        assert_eq!(policy.classify(Duration::from_secs(59)), Freshness::Fresh);
        assert_eq!(policy.classify(Duration::from_secs(60)), Freshness::Expired);
    }

    #[test]
    fn test_ttl_policy_stale_window_never_shorter_than_fresh() {
        let policy = TtlPolicy::new(Duration::from_secs(600), Duration::from_secs(60));
        assert_eq!(policy.stale_window, Duration::from_secs(600));
    }

    #[test]
    fn test_classify_at() {
        let policy = TtlPolicy::new(Duration::from_secs(60), Duration::from_secs(120));
        let now = t0() + chrono::Duration::seconds(90);
        assert_eq!(policy.classify_at(t0(), now), Freshness::Stale);
    }

    #[test]
    fn test_size_budget_within_cap() {
        let budget = SizeBudget::with_low_watermark(1000, 0.8);
        assert_eq!(budget.bytes_to_free(500, 400), 0);
        assert_eq!(budget.bytes_to_free(600, 400), 0);
    }

    #[test]
    fn test_size_budget_evicts_to_low_watermark() {
        let budget = SizeBudget::with_low_watermark(1000, 0.8);
        // 900 + 200 = 1100, target 800 -> free 300
        assert_eq!(budget.bytes_to_free(900, 200), 300);
        assert!(budget.fits(1000));
        assert!(!budget.fits(1001));
    }

    #[test]
    fn test_size_budget_utilization() {
        let budget = SizeBudget::new(1000);
        assert!((budget.utilization(250) - 0.25).abs() < f64::EPSILON);
        assert_eq!(SizeBudget::new(0).utilization(10), 0.0);
    }

    #[test]
    fn test_victims_are_least_recent_first() {
        let candidates = vec![
            candidate("new", 100, 30),
            candidate("old", 100, 10),
            candidate("mid", 100, 20),
        ];
        assert_eq!(select_eviction_victims(&candidates, 150), vec!["old", "mid"]);
        assert_eq!(select_eviction_victims(&candidates, 100), vec!["old"]);
        assert!(select_eviction_victims(&candidates, 0).is_empty());
    }

    #[test]
    fn test_victims_tie_broken_by_key() {
        let candidates = vec![candidate("b", 10, 1), candidate("a", 10, 1)];
        assert_eq!(select_eviction_victims(&candidates, 10), vec!["a"]);
    }

    #[test]
    fn test_victims_unreachable_target_returns_all() {
        let candidates = vec![candidate("a", 10, 1), candidate("b", 10, 2)];
        assert_eq!(select_eviction_victims(&candidates, 1000), vec!["a", "b"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Validity flips exactly at `expires_at`
        #[test]
        fn prop_validity_boundary(ttl_secs in 1u64..1_000_000, offset in -2_000_000i64..2_000_000) {
            let record = CacheRecord::new((), (), t0(), Duration::from_secs(ttl_secs));
            let now = t0() + chrono::Duration::seconds(offset);
            prop_assert_eq!(record.is_valid(now), now < record.expires_at);
        }

        /// Victims cover the target (or everything) and are the least recent
        #[test]
        fn prop_victims_cover_target(
            entries in prop::collection::vec((1u64..500, 0u64..1000), 0..50),
            target in 0u64..10_000,
        ) {
            let candidates: Vec<EvictionCandidate<usize>> = entries
                .iter()
                .enumerate()
                .map(|(i, (size, access))| EvictionCandidate { key: i, size_bytes: *size, last_access: *access })
                .collect();
            let victims = select_eviction_victims(&candidates, target);
            let freed: u64 = victims.iter().map(|k| candidates[*k].size_bytes).sum();
            let total: u64 = candidates.iter().map(|c| c.size_bytes).sum();
            prop_assert!(freed >= target.min(total));

            // No surviving entry is older than any victim
            let newest_victim = victims.iter().map(|k| candidates[*k].last_access).max();
            if let Some(newest) = newest_victim {
                for c in candidates.iter().filter(|c| !victims.contains(&c.key)) {
                    prop_assert!(c.last_access >= newest);
                }
            }
        }
    }
}
