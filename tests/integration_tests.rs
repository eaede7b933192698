//! pairsync Integration Tests
//!
//! End-to-end behavior through the public API:
//! - Image, profile, realtime, presence and network caches
//! - Orchestrator lifecycle, global wipe and sync

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tempfile::TempDir;

use pairsync::adapters::{InMemoryCallables, InMemoryDocumentStore, InMemorySettingsStore};
use pairsync::domain::ports::{CallableResponse, HttpRequest, HttpResponse, HttpTransport, RemoteDocument, Snapshot};
use pairsync::{Clock, ManualClock};

fn days(n: i64) -> chrono::Duration {
    chrono::Duration::days(n)
}

fn make_png(width: u32, height: u32) -> Vec<u8> {
    let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    png.extend_from_slice(&[0, 0, 0, 13]);
    png.extend_from_slice(b"IHDR");
    png.extend_from_slice(&width.to_be_bytes());
    png.extend_from_slice(&height.to_be_bytes());
    png.extend_from_slice(&[8, 6, 0, 0, 0, 0, 0, 0, 0]);
    png
}

fn make_shared_doc(id: &str, pairing_id: &str) -> RemoteDocument {
    RemoteDocument::new(
        id,
        json!({
            "authorId": "u1",
            "partnerIds": ["u1", "u2"],
            "pairingId": pairing_id,
            "updatedAt": 1_700_000_000_000i64,
            "title": format!("item {}", id),
        }),
    )
}

fn make_presence_callables() -> Arc<InMemoryCallables> {
    let callables = Arc::new(InMemoryCallables::new());
    callables.register("getPartnerPresence", |_: &Value| {
        Ok(CallableResponse::ok(json!({"mood": "calm", "distance": 42})))
    });
    callables.register("getPartnerDistance", |_: &Value| Ok(CallableResponse::ok(json!(40))));
    callables
}

/// Transport answering every request with its path
#[derive(Default)]
struct EchoTransport {
    calls: AtomicU64,
}

#[async_trait]
impl HttpTransport for EchoTransport {
    async fn send(&self, request: &HttpRequest) -> pairsync::Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(HttpResponse::ok(request.path().to_string()))
    }
}

// =============================================================================
// Image Cache
// =============================================================================

mod image_tests {
    use super::*;
    use pairsync::cache::{ImageCache, ImageCacheConfig};

    fn make_cache(dir: &TempDir, memory: u64, disk: u64) -> (ImageCache, Arc<ManualClock>) {
        let clock = ManualClock::starting_now();
        let config = ImageCacheConfig {
            directory: dir.path().join("images"),
            memory_capacity_bytes: memory,
            disk_capacity_bytes: disk,
            ..Default::default()
        };
        (ImageCache::new(&config, clock.clone()).unwrap(), clock)
    }

    #[tokio::test]
    async fn test_image_expires_from_disk_after_ttl() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = make_cache(&dir, 1 << 20, 1 << 20);

        cache.put("a.jpg", Bytes::from_static(b"jpeg bytes"));
        cache.flush().await;
        let blob = cache.get("a.jpg").await.unwrap();
        assert_eq!(blob.bytes, Bytes::from_static(b"jpeg bytes"));

        cache.clear_memory();
        clock.advance(days(8));
        assert!(cache.get("a.jpg").await.is_none());
        assert_eq!(cache.metrics().misses_expired, 1);
    }

    #[tokio::test]
    async fn test_put_then_get_before_disk_write() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = make_cache(&dir, 1 << 20, 1 << 20);

        cache.put("b.jpg", Bytes::from_static(b"fresh"));
        let blob = cache.get("b.jpg").await.unwrap();
        assert_eq!(blob.bytes, Bytes::from_static(b"fresh"));
        cache.flush().await;
    }

    #[tokio::test]
    async fn test_tiers_stay_within_capacity() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = make_cache(&dir, 1_000, 2_000);

        for i in 0..20 {
            cache.put(&format!("img-{}.jpg", i), Bytes::from(vec![i as u8; 300]));
            cache.flush().await;
            let stats = cache.stats();
            assert!(stats.memory_bytes <= 1_000, "memory tier over cap: {}", stats.memory_bytes);
            assert!(stats.disk_bytes <= 2_000, "disk tier over cap: {}", stats.disk_bytes);
        }
        assert!(cache.metrics().evictions > 0);

        // Most recent survives
        assert!(cache.get("img-19.jpg").await.is_some());
    }
}

// =============================================================================
// Profile Cache
// =============================================================================

mod profile_tests {
    use super::*;
    use pairsync::adapters::InMemoryBlobStore;
    use pairsync::cache::{ProfileCache, ProfileCacheConfig, ProfileRecord};
    use pairsync::domain::ports::SettingsStore;

    fn make_record() -> ProfileRecord {
        ProfileRecord {
            user_id: "u1".to_string(),
            display_name: "Sam".to_string(),
            partner_id: Some("u2".to_string()),
            pairing_id: Some("p1".to_string()),
            avatar_url: None,
            partner_avatar_url: None,
            extra: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_profile_expires_after_seven_days() {
        let dir = TempDir::new().unwrap();
        let settings = Arc::new(InMemorySettingsStore::new());
        let clock = ManualClock::starting_now();
        let cache = ProfileCache::new(
            settings.clone(),
            Arc::new(InMemoryBlobStore::new()),
            clock.clone(),
            ProfileCacheConfig {
                ttl: Duration::from_secs(7 * 24 * 3600),
                avatar_directory: dir.path().join("avatars"),
            },
        );

        cache.put(make_record()).await.unwrap();

        clock.advance(days(6));
        assert_eq!(cache.get().await, Some(make_record()));

        clock.advance(days(2));
        assert_eq!(cache.get().await, None);
        assert_eq!(settings.get("profile.record").await.unwrap(), None);
        assert_eq!(cache.metrics().await.misses_expired, 1);
    }
}

// =============================================================================
// Realtime Cache
// =============================================================================

mod realtime_tests {
    use super::*;
    use pairsync::adapters::SqliteStore;
    use pairsync::cache::{RealtimeCache, RealtimeConfig};
    use pairsync::domain::ports::DocumentStore;

    fn make_cache() -> (Arc<RealtimeCache>, Arc<InMemoryDocumentStore>) {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let cache = Arc::new(RealtimeCache::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            documents.clone(),
            ManualClock::starting_now(),
            RealtimeConfig::default(),
        ));
        (cache, documents)
    }

    fn make_snapshot(ids: &[&str]) -> Snapshot {
        Snapshot::new("sharedItems", ids.iter().map(|id| make_shared_doc(id, "p1")).collect())
    }

    #[tokio::test]
    async fn test_snapshot_reconciles_mirror() {
        let (cache, _) = make_cache();
        cache.apply_snapshot("p1", make_snapshot(&["1", "2", "3"])).await;
        cache.apply_snapshot("p1", make_snapshot(&["2", "3", "4"])).await;

        let ids: Vec<String> = cache.mirror_ids("p1").await.unwrap().into_iter().collect();
        assert_eq!(ids, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_listener_mirror_matches_remote() {
        let (cache, documents) = make_cache();
        for id in ["1", "2", "3"] {
            documents.seed("sharedItems", id, make_shared_doc(id, "p1").fields);
        }
        // Another pairing's record never reaches this mirror
        documents.seed("sharedItems", "x", make_shared_doc("x", "p2").fields);

        let mut view = cache.subscribe("p1");
        cache.start("p1", "u1").await.unwrap();
        documents.delete("sharedItems", "1").await.unwrap();
        documents
            .write("sharedItems", "4", make_shared_doc("4", "p1").fields)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current: Vec<String> = view.borrow().iter().map(|i| i.record.id.clone()).collect();
                if current == ["2", "3", "4"] {
                    break;
                }
                view.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        cache.stop_all().await;
        let ids: Vec<String> = cache.mirror_ids("p1").await.unwrap().into_iter().collect();
        assert_eq!(ids, vec!["2", "3", "4"]);
    }
}

// =============================================================================
// Presence Cache
// =============================================================================

mod presence_tests {
    use super::*;
    use pairsync::cache::{PresenceCache, PresenceConfig};

    #[tokio::test]
    async fn test_throttle_limits_remote_calls() {
        let callables = make_presence_callables();
        let clock = ManualClock::starting_now();
        let cache = PresenceCache::new(
            Arc::new(InMemorySettingsStore::new()),
            callables.clone(),
            clock.clone(),
            PresenceConfig::default(),
        );

        let first = cache.fetch("u2", false).await.unwrap();
        assert_eq!(first.remote_calls, 1);
        assert_eq!(first.presence.signal, json!(42));

        clock.advance(chrono::Duration::seconds(10));
        let second = cache.fetch("u2", false).await.unwrap();
        assert_eq!(second.remote_calls, 0);
        assert_eq!(callables.total_calls(), 1);

        // Signal expired, data still valid
        clock.advance(chrono::Duration::seconds(30));
        let third = cache.fetch("u2", false).await.unwrap();
        assert_eq!(third.presence.signal, json!(40));
        assert_eq!(callables.call_count("getPartnerDistance"), 1);
        assert_eq!(callables.call_count("getPartnerPresence"), 1);
    }
}

// =============================================================================
// Network Cache
// =============================================================================

mod network_tests {
    use super::*;
    use assert_matches::assert_matches;
    use pairsync::cache::{Connectivity, NetworkCache, NetworkCacheConfig};
    use pairsync::Error;

    #[tokio::test]
    async fn test_offline_serves_cached_and_rejects_uncached() {
        let transport = Arc::new(EchoTransport::default());
        let connectivity = Connectivity::new(true);
        let cache = NetworkCache::new(
            transport.clone(),
            connectivity.clone(),
            ManualClock::starting_now(),
            NetworkCacheConfig::default(),
        );

        let request = HttpRequest::get("https://api.example.com/static/config.json");
        let online = cache.fetch(&request).await.unwrap();
        connectivity.set_online(false);

        let offline = cache.fetch(&request).await.unwrap();
        assert_eq!(offline.body, online.body);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let uncached = HttpRequest::get("https://api.example.com/static/other.json");
        assert_matches!(cache.fetch(&uncached).await, Err(Error::Offline(_)));
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

mod orchestrator_tests {
    use super::*;
    use chrono::Utc;
    use pairsync::adapters::RecordingNotifier;
    use pairsync::cache::{AvatarRole, ContentKind, DailyContent, ProfileRecord};
    use pairsync::{CacheHealth, Orchestrator, PairsyncConfig};

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        documents: Arc<InMemoryDocumentStore>,
        clock: Arc<ManualClock>,
        _dir: TempDir,
    }

    async fn make_fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::starting_now();
        let documents = Arc::new(InMemoryDocumentStore::new());
        let orchestrator = Orchestrator::builder(PairsyncConfig::default().with_data_dir(dir.path()))
            .clock(clock.clone())
            .documents(documents.clone())
            .callables(make_presence_callables())
            .settings(Arc::new(InMemorySettingsStore::new()))
            .transport(Arc::new(EchoTransport::default()))
            .notifier(Arc::new(RecordingNotifier::new()))
            .build()
            .await
            .unwrap();
        Fixture {
            orchestrator: Arc::new(orchestrator),
            documents,
            clock,
            _dir: dir,
        }
    }

    /// Put something in every component
    async fn populate(f: &Fixture) {
        let o = &f.orchestrator;
        let now = f.clock.now();

        o.content()
            .upsert(&DailyContent {
                pairing_id: "p1".to_string(),
                day: now.date_naive(),
                kind: ContentKind::Question,
                content_id: "q1".to_string(),
                payload: json!({"text": "What made you smile today?"}),
                cached_at: now,
            })
            .await
            .unwrap();

        o.image().put("https://cdn.example.com/a.jpg", Bytes::from_static(b"jpeg"));
        o.image().flush().await;

        o.profile()
            .put(ProfileRecord {
                user_id: "u1".to_string(),
                display_name: "Sam".to_string(),
                partner_id: Some("u2".to_string()),
                pairing_id: Some("p1".to_string()),
                avatar_url: None,
                partner_avatar_url: None,
                extra: Value::Null,
            })
            .await
            .unwrap();
        o.profile()
            .put_avatar(AvatarRole::User, "https://cdn.example.com/me.png", Bytes::from(make_png(64, 64)))
            .await
            .unwrap();

        o.realtime()
            .apply_snapshot(
                "p1",
                Snapshot::new(
                    "sharedItems",
                    ["1", "2"].iter().map(|id| make_shared_doc(id, "p1")).collect(),
                ),
            )
            .await;

        o.presence().fetch("u2", false).await.unwrap();
        o.network()
            .fetch(&HttpRequest::get("https://api.example.com/static/config.json"))
            .await
            .unwrap();

        let report = o.sync_all("u1", "p1").await.unwrap();
        assert_eq!(report.images_exported, 1);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_populated_components_report_entries() {
        let f = make_fixture().await;
        f.orchestrator.initialize().await.unwrap();
        populate(&f).await;

        for (component, metrics) in f.orchestrator.metrics().await {
            assert!(metrics.entries > 0, "{} has no entries", component);
        }
        let snapshot = f.orchestrator.widget().read_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.fields["display_name"], json!("Sam"));
        assert_eq!(snapshot.fields["daily"]["question"]["text"], json!("What made you smile today?"));
        assert!(snapshot.images.contains_key("user_avatar"));
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_wipe_during_sweep_leaves_healthy_empty_cache() {
        let f = make_fixture().await;
        f.orchestrator.initialize().await.unwrap();
        populate(&f).await;

        let sweeper = {
            let o = Arc::clone(&f.orchestrator);
            tokio::spawn(async move {
                for _ in 0..10 {
                    o.content().purge_expired().await.unwrap();
                    o.image().cleanup_disk().await.unwrap();
                    o.widget().purge_stale().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let report = f.orchestrator.wipe_all().await;
        sweeper.await.unwrap();

        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(report.cleared.len(), 7);

        let health = f.orchestrator.health().await;
        assert_eq!(health.status, CacheHealth::Healthy, "{:?}", health.probes);
        assert!(health.ready);
        assert!(f.orchestrator.is_ready());

        for (component, metrics) in f.orchestrator.metrics().await {
            assert_eq!(metrics.entries, 0, "{} kept entries after wipe", component);
        }
        assert!(f.orchestrator.realtime().view("p1").is_empty());
        assert!(f.orchestrator.presence().peek("u2").is_none());
        assert!(f.orchestrator.profile().get().await.is_none());
        assert!(f.orchestrator.widget().read_snapshot().await.unwrap().is_none());
        let rows: u64 = f
            .orchestrator
            .store()
            .table_counts()
            .await
            .unwrap()
            .iter()
            .map(|(_, rows)| rows)
            .sum();
        assert_eq!(rows, 0);
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_wipe_is_idempotent() {
        let f = make_fixture().await;
        f.orchestrator.initialize().await.unwrap();
        populate(&f).await;

        let first = f.orchestrator.wipe_all().await;
        let second = f.orchestrator.wipe_all().await;
        assert_eq!(first.cleared, second.cleared);
        assert!(second.failures.is_empty());
        assert_eq!(second.health, CacheHealth::Healthy);
        f.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_primes_missing_content_from_remote() {
        let f = make_fixture().await;
        f.orchestrator.initialize().await.unwrap();

        let today = Utc::now().date_naive();
        f.clock.set(Utc::now());
        f.documents.seed(
            "dailyChallenges",
            "c1",
            json!({"pairingId": "p1", "day": today.format("%Y-%m-%d").to_string(), "task": "cook together"}),
        );

        let report = f.orchestrator.sync_all("u1", "p1").await.unwrap();
        assert_eq!(report.content_primed, 1);

        let cached = f
            .orchestrator
            .content()
            .get_for_day(ContentKind::Challenge, "p1", today)
            .await
            .unwrap();
        assert_eq!(cached.content_id, "c1");
        f.orchestrator.shutdown().await;
    }
}
