//! Network Response Cache
//!
//! Per-endpoint cache policy around an [`HttpTransport`]. The policy is picked
//! from the request path by the longest matching prefix rule:
//!
//! | Policy   | Fresh | Offline ceiling |
//! |----------|-------|-----------------|
//! | Static   | 24 h  | 7 d             |
//! | Dynamic  | 5 min | 24 h            |
//! | Realtime | never cached            |
//!
//! While offline, requests are answered from the cache only, up to the
//! offline ceiling. While online, a failed transport call falls back to a
//! cached copy within the same ceiling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::cache::metrics::{CacheCounters, ComponentMetrics, MissReason};
use crate::cache::ttl::{secs, select_eviction_victims, EvictionCandidate, Freshness, SizeBudget, TtlPolicy};
use crate::clock::Clock;
use crate::domain::ports::{HttpRequest, HttpResponse, HttpTransport};
use crate::error::{Error, Result};

/// Cache policy for one class of endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointPolicy {
    /// Rarely changing assets
    Static,
    /// Ordinary API responses
    Dynamic,
    /// Never cached
    Realtime,
}

/// Maps a path prefix to a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub prefix: String,
    pub policy: EndpointPolicy,
}

impl PolicyRule {
    pub fn new(prefix: impl Into<String>, policy: EndpointPolicy) -> Self {
        Self {
            prefix: prefix.into(),
            policy,
        }
    }
}

/// Network cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkCacheConfig {
    pub rules: Vec<PolicyRule>,
    /// Policy for paths no rule matches
    pub default_policy: EndpointPolicy,
    #[serde(with = "secs")]
    pub static_fresh: Duration,
    #[serde(with = "secs")]
    pub static_offline_ceiling: Duration,
    #[serde(with = "secs")]
    pub dynamic_fresh: Duration,
    #[serde(with = "secs")]
    pub dynamic_offline_ceiling: Duration,
    pub capacity_bytes: u64,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
}

impl Default for NetworkCacheConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                PolicyRule::new("/static/", EndpointPolicy::Static),
                PolicyRule::new("/assets/", EndpointPolicy::Static),
                PolicyRule::new("/live/", EndpointPolicy::Realtime),
            ],
            default_policy: EndpointPolicy::Dynamic,
            static_fresh: Duration::from_secs(24 * 3600),
            static_offline_ceiling: Duration::from_secs(7 * 24 * 3600),
            dynamic_fresh: Duration::from_secs(5 * 60),
            dynamic_offline_ceiling: Duration::from_secs(24 * 3600),
            capacity_bytes: 20 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkCacheConfig {
    /// Policy for a request path; the longest matching prefix wins
    pub fn policy_for(&self, path: &str) -> EndpointPolicy {
        self.rules
            .iter()
            .filter(|rule| path.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| rule.policy)
            .unwrap_or(self.default_policy)
    }

    fn ttl_for(&self, policy: EndpointPolicy) -> Option<TtlPolicy> {
        match policy {
            EndpointPolicy::Static => Some(TtlPolicy::new(self.static_fresh, self.static_offline_ceiling)),
            EndpointPolicy::Dynamic => Some(TtlPolicy::new(self.dynamic_fresh, self.dynamic_offline_ceiling)),
            EndpointPolicy::Realtime => None,
        }
    }
}

/// Shared online/offline flag
#[derive(Debug)]
pub struct Connectivity {
    online: AtomicBool,
}

impl Connectivity {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(online),
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::AcqRel);
        if was != online {
            debug!(online, "Connectivity changed");
        }
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }
}

struct Entry {
    response: HttpResponse,
    cached_at: DateTime<Utc>,
    size_bytes: u64,
    last_access: u64,
}

fn response_size(response: &HttpResponse) -> u64 {
    let headers: usize = response.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
    (response.body.len() + headers) as u64
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, Entry>,
    size_bytes: u64,
}

impl Entries {
    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.map.remove(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }
}

/// HTTP response cache
pub struct NetworkCache {
    transport: Arc<dyn HttpTransport>,
    connectivity: Arc<Connectivity>,
    clock: Arc<dyn Clock>,
    config: NetworkCacheConfig,
    budget: SizeBudget,
    entries: Mutex<Entries>,
    access_seq: AtomicU64,
    counters: CacheCounters,
}

impl NetworkCache {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        connectivity: Arc<Connectivity>,
        clock: Arc<dyn Clock>,
        config: NetworkCacheConfig,
    ) -> Self {
        let budget = SizeBudget::new(config.capacity_bytes);
        Self {
            transport,
            connectivity,
            clock,
            config,
            budget,
            entries: Mutex::new(Entries::default()),
            access_seq: AtomicU64::new(0),
            counters: CacheCounters::new(),
        }
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    pub fn policy_for(&self, request: &HttpRequest) -> EndpointPolicy {
        self.config.policy_for(request.path())
    }

    /// Send a request through the cache
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let policy = self.policy_for(request);
        let ttl = match self.config.ttl_for(policy) {
            Some(ttl) if request.method.eq_ignore_ascii_case("GET") => ttl,
            _ => return self.send(request).await,
        };

        let now = self.clock.now();
        let cached = self.lookup(&request.url, &ttl, now);

        if !self.connectivity.is_online() {
            return match cached {
                Some((response, _)) => {
                    debug!("Offline, serving cached response");
                    self.counters.record_hit();
                    Ok(response)
                }
                None => Err(Error::Offline(request.url.clone())),
            };
        }

        if let Some((response, Freshness::Fresh)) = &cached {
            debug!(?policy, "Network cache hit");
            self.counters.record_hit();
            return Ok(response.clone());
        }
        if cached.is_some() {
            self.counters.record_miss(MissReason::Expired);
        }

        match self.send(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(&request.url, response.clone(), now);
                }
                Ok(response)
            }
            Err(e) => match cached {
                Some((response, _)) => {
                    warn!(error = %e, "Transport failed, serving cached response");
                    Ok(response)
                }
                None => Err(match e {
                    Error::Remote { .. } => e,
                    other => Error::remote(request.url.clone(), other.to_string()),
                }),
            },
        }
    }

    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.counters.record_remote_call();
        self.transport
            .send(request)
            .await
            .inspect_err(|_| self.counters.record_remote_failure())
    }

    /// Servable cached copy and its freshness. Expired entries are dropped.
    fn lookup(&self, key: &str, ttl: &TtlPolicy, now: DateTime<Utc>) -> Option<(HttpResponse, Freshness)> {
        let mut entries = self.entries.lock();
        let freshness = match entries.map.get(key) {
            Some(entry) => ttl.classify_at(entry.cached_at, now),
            None => {
                self.counters.record_miss(MissReason::NotFound);
                return None;
            }
        };
        if !freshness.is_servable() {
            entries.remove(key);
            self.counters.record_miss(MissReason::Expired);
            return None;
        }
        let seq = self.access_seq.fetch_add(1, Ordering::Relaxed);
        let entry = entries.map.get_mut(key)?;
        entry.last_access = seq;
        Some((entry.response.clone(), freshness))
    }

    fn store(&self, key: &str, response: HttpResponse, now: DateTime<Utc>) {
        let size_bytes = response_size(&response);
        if !self.budget.fits(size_bytes) {
            debug!(size_bytes, "Response larger than the cache, not stored");
            return;
        }

        let mut entries = self.entries.lock();
        entries.remove(key);

        let to_free = self.budget.bytes_to_free(entries.size_bytes, size_bytes);
        if to_free > 0 {
            let candidates: Vec<EvictionCandidate<String>> = entries
                .map
                .iter()
                .map(|(k, e)| EvictionCandidate {
                    key: k.clone(),
                    size_bytes: e.size_bytes,
                    last_access: e.last_access,
                })
                .collect();
            let victims = select_eviction_victims(&candidates, to_free);
            for victim in &victims {
                entries.remove(victim);
            }
            self.counters.record_evictions(victims.len() as u64);
        }

        entries.size_bytes += size_bytes;
        entries.map.insert(
            key.to_string(),
            Entry {
                response,
                cached_at: now,
                size_bytes,
                last_access: self.access_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        self.counters.record_write();
    }

    /// Drop one cached URL
    pub fn invalidate(&self, url: &str) -> bool {
        self.entries.lock().remove(url).is_some()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        entries.map.clear();
        entries.size_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> ComponentMetrics {
        let entries = self.entries.lock();
        self.counters
            .snapshot(entries.map.len() as u64, entries.size_bytes)
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }
}
