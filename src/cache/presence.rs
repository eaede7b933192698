//! Temporal Throttle Cache
//!
//! Guards the expensive partner presence call with two independently
//! expiring fields that share one remote identity:
//!
//! - **data** (minutes): slow-changing attributes, refreshed by the full call
//! - **signal** (seconds): a near-live attribute such as distance, refreshed
//!   by a cheap call while the data is still valid
//!
//! A full refresh fills both fields from its own response. Results are
//! committed last-writer-wins by request start time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::cache::metrics::{CacheCounters, ComponentMetrics, MissReason};
use crate::cache::ttl::{secs, Freshness, TtlPolicy};
use crate::clock::Clock;
use crate::domain::ports::{CallableFunctions, SettingsStore};
use crate::domain::{CacheEvent, ChangeFeed};
use crate::error::{Error, Result};

const KEY_PREFIX: &str = "presence.";

/// Presence cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    #[serde(with = "secs")]
    pub data_ttl: Duration,
    #[serde(with = "secs")]
    pub signal_ttl: Duration,
    /// Oldest value served when a refresh fails
    #[serde(with = "secs")]
    pub stale_ceiling: Duration,
    /// Callable returning the data and the signal
    pub full_function: String,
    /// Callable returning the signal only
    pub signal_function: String,
    /// Field of the full response holding the signal
    pub signal_field: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            data_ttl: Duration::from_secs(5 * 60),
            signal_ttl: Duration::from_secs(30),
            stale_ceiling: Duration::from_secs(60 * 60),
            full_function: "getPartnerPresence".to_string(),
            signal_function: "getPartnerDistance".to_string(),
            signal_field: "distance".to_string(),
        }
    }
}

/// Cached presence of one partner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    pub partner_id: String,
    pub data: Value,
    pub signal: Value,
    /// Start of the request that produced `data`
    pub data_cached_at: DateTime<Utc>,
    /// Start of the request that produced `signal`
    pub signal_cached_at: DateTime<Utc>,
}

/// Result of a fetch
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceReading {
    pub presence: PresenceData,
    /// Served past its TTL because the refresh failed
    pub stale: bool,
    /// Remote calls issued by this fetch
    pub remote_calls: u32,
}

/// What a fetch has to do given the cached state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Cached,
    SignalOnly,
    Full,
}

/// Two-speed presence cache
pub struct PresenceCache {
    settings: Arc<dyn SettingsStore>,
    callables: Arc<dyn CallableFunctions>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
    data_policy: TtlPolicy,
    signal_policy: TtlPolicy,
    entries: DashMap<String, PresenceData>,
    /// Per-partner fetch serialization
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    counters: CacheCounters,
    feed: ChangeFeed,
}

impl PresenceCache {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        callables: Arc<dyn CallableFunctions>,
        clock: Arc<dyn Clock>,
        config: PresenceConfig,
    ) -> Self {
        let data_policy = TtlPolicy::new(config.data_ttl, config.stale_ceiling);
        let signal_policy = TtlPolicy::new(config.signal_ttl, config.stale_ceiling);
        Self {
            settings,
            callables,
            clock,
            config,
            data_policy,
            signal_policy,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            counters: CacheCounters::new(),
            feed: ChangeFeed::default(),
        }
    }

    fn plan(&self, cached: Option<&PresenceData>, now: DateTime<Utc>, force: bool) -> Plan {
        let Some(cached) = cached else {
            return Plan::Full;
        };
        if force {
            return Plan::Full;
        }
        let data = self.data_policy.classify_at(cached.data_cached_at, now);
        let signal = self.signal_policy.classify_at(cached.signal_cached_at, now);
        match (data, signal) {
            (Freshness::Fresh, Freshness::Fresh) => Plan::Cached,
            (Freshness::Fresh, _) => Plan::SignalOnly,
            _ => Plan::Full,
        }
    }

    /// Cached presence without any remote call
    pub fn peek(&self, partner_id: &str) -> Option<PresenceData> {
        self.entries.get(partner_id).map(|e| e.value().clone())
    }

    /// Fetch presence, calling the remote only as much as the TTLs require
    #[instrument(skip(self))]
    pub async fn fetch(&self, partner_id: &str, force_refresh: bool) -> Result<PresenceReading> {
        let started = self.clock.now();
        let lock = Arc::clone(
            self.in_flight
                .entry(partner_id.to_string())
                .or_default()
                .value(),
        );
        let _guard = lock.lock().await;

        let now = self.clock.now();
        let cached = self.peek(partner_id);
        let plan = self.plan(cached.as_ref(), now, force_refresh);

        match (plan, cached) {
            (Plan::Cached, Some(presence)) => {
                debug!("Presence served from cache");
                self.counters.record_hit();
                Ok(PresenceReading {
                    presence,
                    stale: false,
                    remote_calls: 0,
                })
            }
            (Plan::SignalOnly, Some(cached)) => {
                self.counters.record_miss(MissReason::Expired);
                match self.call_signal(partner_id).await {
                    Ok(signal) => {
                        let mut next = cached.clone();
                        next.signal = signal;
                        next.signal_cached_at = started;
                        let presence = self.commit(next, started, false).await;
                        Ok(PresenceReading {
                            presence,
                            stale: false,
                            remote_calls: 1,
                        })
                    }
                    Err(e) => self.serve_stale(cached, now, 1, e),
                }
            }
            (_, cached) => {
                if cached.is_none() {
                    self.counters.record_miss(MissReason::NotFound);
                } else {
                    self.counters.record_miss(MissReason::Expired);
                }
                match self.call_full(partner_id).await {
                    Ok((data, signal)) => {
                        let next = PresenceData {
                            partner_id: partner_id.to_string(),
                            data,
                            signal,
                            data_cached_at: started,
                            signal_cached_at: started,
                        };
                        let presence = self.commit(next, started, true).await;
                        Ok(PresenceReading {
                            presence,
                            stale: false,
                            remote_calls: 1,
                        })
                    }
                    Err(e) => match cached {
                        Some(cached) => self.serve_stale(cached, now, 1, e),
                        None => Err(e),
                    },
                }
            }
        }
    }

    fn serve_stale(
        &self,
        cached: PresenceData,
        now: DateTime<Utc>,
        remote_calls: u32,
        error: Error,
    ) -> Result<PresenceReading> {
        let servable = self
            .data_policy
            .classify_at(cached.data_cached_at, now)
            .is_servable();
        if servable {
            warn!(error = %error, "Presence refresh failed, serving stale value");
            Ok(PresenceReading {
                presence: cached,
                stale: true,
                remote_calls,
            })
        } else {
            Err(error)
        }
    }

    async fn invoke(&self, name: &str, partner_id: &str) -> Result<Value> {
        self.counters.record_remote_call();
        let response = self
            .callables
            .call(name, json!({ "partnerId": partner_id }))
            .await
            .inspect_err(|_| self.counters.record_remote_failure())?;
        if !response.success {
            self.counters.record_remote_failure();
            return Err(Error::remote(
                name,
                response.message.unwrap_or_else(|| "unsuccessful".to_string()),
            ));
        }
        Ok(response.data)
    }

    async fn call_signal(&self, partner_id: &str) -> Result<Value> {
        self.invoke(&self.config.signal_function, partner_id).await
    }

    /// Full call; the signal is taken from the same response
    async fn call_full(&self, partner_id: &str) -> Result<(Value, Value)> {
        let mut data = self.invoke(&self.config.full_function, partner_id).await?;
        let signal = match &mut data {
            Value::Object(map) => map.remove(&self.config.signal_field).unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Ok((data, signal))
    }

    /// Store `next` unless a newer request already committed. Returns the
    /// value now held by the cache.
    async fn commit(&self, next: PresenceData, started: DateTime<Utc>, full: bool) -> PresenceData {
        let committed = {
            let mut entry = self
                .entries
                .entry(next.partner_id.clone())
                .or_insert_with(|| next.clone());
            let current = entry.value_mut();
            let newest = current.data_cached_at.max(current.signal_cached_at);
            if newest > started {
                debug!("Discarding presence result older than the stored value");
                return current.clone();
            }
            *current = next;
            current.clone()
        };

        self.counters.record_write();
        self.persist(&committed).await;
        self.feed.publish(CacheEvent::PresenceUpdated {
            partner_id: committed.partner_id.clone(),
            full,
        });
        committed
    }

    async fn persist(&self, presence: &PresenceData) {
        let encoded = match serde_json::to_string(presence) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode presence");
                self.counters.record_storage_failure();
                return;
            }
        };
        let key = format!("{}{}", KEY_PREFIX, presence.partner_id);
        if let Err(e) = self.settings.put(&key, encoded).await {
            warn!(error = %e, "Failed to persist presence, memory only");
            self.counters.record_storage_failure();
        }
    }

    /// Restore the last persisted presence of a partner. Returns true if a
    /// value was loaded.
    pub async fn preload(&self, partner_id: &str) -> Result<bool> {
        let key = format!("{}{}", KEY_PREFIX, partner_id);
        let Some(raw) = self.settings.get(&key).await? else {
            return Ok(false);
        };
        match serde_json::from_str::<PresenceData>(&raw) {
            Ok(presence) => {
                let now = self.clock.now();
                if !self.data_policy.classify_at(presence.data_cached_at, now).is_servable() {
                    debug!(partner_id, "Persisted presence past the stale ceiling, dropped");
                    self.settings.remove(&key).await?;
                    return Ok(false);
                }
                self.entries.insert(partner_id.to_string(), presence);
                Ok(true)
            }
            Err(e) => {
                warn!(partner_id, error = %e, "Corrupt persisted presence deleted");
                self.counters.record_miss(MissReason::Corrupt);
                self.settings.remove(&key).await?;
                Ok(false)
            }
        }
    }

    /// Forget every partner, in memory and persisted
    pub async fn clear(&self) -> Result<()> {
        self.entries.clear();
        self.settings.remove_prefix(KEY_PREFIX).await?;
        self.feed.publish(CacheEvent::Cleared {
            component: "presence".to_string(),
        });
        Ok(())
    }

    pub fn metrics(&self) -> ComponentMetrics {
        self.counters.snapshot(self.entries.len() as u64, 0)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCallables, InMemorySettingsStore};
    use crate::clock::ManualClock;
    use crate::domain::ports::CallableResponse;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct Fixture {
        cache: PresenceCache,
        callables: Arc<InMemoryCallables>,
        settings: Arc<InMemorySettingsStore>,
        clock: Arc<ManualClock>,
        failing: Arc<AtomicBool>,
    }

    fn make_fixture() -> Fixture {
        let callables = Arc::new(InMemoryCallables::new());
        let failing = Arc::new(AtomicBool::new(false));
        let seq = Arc::new(AtomicU64::new(0));

        let fail = Arc::clone(&failing);
        let n = Arc::clone(&seq);
        callables.register("getPartnerPresence", move |_| {
            if fail.load(Ordering::SeqCst) {
                return Err(Error::remote("getPartnerPresence", "unavailable"));
            }
            let call = n.fetch_add(1, Ordering::SeqCst);
            Ok(CallableResponse::ok(json!({"mood": "happy", "call": call, "distance": 120})))
        });
        let fail = Arc::clone(&failing);
        callables.register("getPartnerDistance", move |_| {
            if fail.load(Ordering::SeqCst) {
                return Ok(CallableResponse::failed("quota exceeded"));
            }
            Ok(CallableResponse::ok(json!(80)))
        });

        let settings = Arc::new(InMemorySettingsStore::new());
        let clock = ManualClock::starting_now();
        let cache = PresenceCache::new(
            settings.clone(),
            callables.clone(),
            clock.clone(),
            PresenceConfig::default(),
        );
        Fixture {
            cache,
            callables,
            settings,
            clock,
            failing,
        }
    }

    fn seconds(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[tokio::test]
    async fn test_full_call_fills_both_fields() {
        let f = make_fixture();
        let reading = f.cache.fetch("partner", false).await.unwrap();

        assert_eq!(reading.remote_calls, 1);
        assert_eq!(reading.presence.signal, json!(120));
        assert_eq!(reading.presence.data, json!({"mood": "happy", "call": 0}));
        assert_eq!(f.callables.call_count("getPartnerDistance"), 0);
    }

    #[tokio::test]
    async fn test_two_fetches_within_signal_ttl_make_one_call() {
        let f = make_fixture();
        f.cache.fetch("partner", false).await.unwrap();
        f.clock.advance(seconds(10));
        let second = f.cache.fetch("partner", false).await.unwrap();

        assert_eq!(second.remote_calls, 0);
        assert_eq!(f.callables.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_only_signal_refreshed_while_data_valid() {
        let f = make_fixture();
        f.cache.fetch("partner", false).await.unwrap();
        f.clock.advance(seconds(45));

        let reading = f.cache.fetch("partner", false).await.unwrap();
        assert_eq!(reading.remote_calls, 1);
        assert_eq!(reading.presence.signal, json!(80));
        assert_eq!(f.callables.call_count("getPartnerPresence"), 1);
        assert_eq!(f.callables.call_count("getPartnerDistance"), 1);

        f.clock.advance(seconds(5 * 60));
        f.cache.fetch("partner", false).await.unwrap();
        assert_eq!(f.callables.call_count("getPartnerPresence"), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_always_calls_full() {
        let f = make_fixture();
        f.cache.fetch("partner", false).await.unwrap();
        let reading = f.cache.fetch("partner", true).await.unwrap();
        assert_eq!(reading.presence.data["call"], json!(1));
    }

    #[tokio::test]
    async fn test_failure_serves_stale_within_ceiling() {
        let f = make_fixture();
        f.cache.fetch("partner", false).await.unwrap();
        f.failing.store(true, Ordering::SeqCst);

        f.clock.advance(seconds(10 * 60));
        let reading = f.cache.fetch("partner", false).await.unwrap();
        assert!(reading.stale);

        f.clock.advance(seconds(60 * 60));
        let result = f.cache.fetch("partner", false).await;
        assert_matches!(result, Err(Error::Remote { .. }));
        assert!(f.cache.counters().remote_failures() >= 2);
    }

    #[tokio::test]
    async fn test_full_failure_without_cache_is_remote_error() {
        let f = make_fixture();
        f.failing.store(true, Ordering::SeqCst);
        let result = f.cache.fetch("partner", false).await;
        assert_matches!(result, Err(Error::Remote { operation, .. }) if operation == "getPartnerPresence");
    }

    #[tokio::test]
    async fn test_older_request_does_not_overwrite_newer() {
        let f = make_fixture();
        let t0 = f.clock.now();
        f.clock.advance(seconds(5));
        f.cache.fetch("partner", true).await.unwrap();

        let late = PresenceData {
            partner_id: "partner".into(),
            data: json!({"mood": "old"}),
            signal: json!(1),
            data_cached_at: t0,
            signal_cached_at: t0,
        };
        let kept = f.cache.commit(late, t0, true).await;
        assert_eq!(kept.data["mood"], json!("happy"));
    }

    #[tokio::test]
    async fn test_preload_restores_persisted_presence() {
        let f = make_fixture();
        f.cache.fetch("partner", false).await.unwrap();

        let restored = PresenceCache::new(
            f.settings.clone(),
            f.callables.clone(),
            f.clock.clone(),
            PresenceConfig::default(),
        );
        assert!(restored.preload("partner").await.unwrap());
        let reading = restored.fetch("partner", false).await.unwrap();
        assert_eq!(reading.remote_calls, 0);

        restored.clear().await.unwrap();
        assert!(f.settings.is_empty());
        assert!(restored.peek("partner").is_none());
    }
}
