//! Structured Content Cache
//!
//! Daily content (the question and the challenge of the day) persisted in
//! the SQLite store, keyed by `(kind, pairing_id, day)`. There is no live
//! listener: rows are written after a successful remote fetch, either by a
//! feature module or by [`ContentCache::refresh_from_remote`].
//!
//! Rows older than the retention window are purged by a sweeper that runs
//! independently of reads.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::SqliteStore;
use crate::cache::metrics::{CacheCounters, ComponentMetrics, MissReason};
use crate::cache::spawn_periodic;
use crate::cache::ttl::secs;
use crate::clock::Clock;
use crate::domain::ports::{DocumentStore, QueryFilter};
use crate::domain::{CacheEvent, ChangeFeed};
use crate::error::{Error, Result};

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Kind of daily content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Question,
    Challenge,
}

impl ContentKind {
    pub const ALL: [ContentKind; 2] = [ContentKind::Question, ContentKind::Challenge];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Question => "question",
            ContentKind::Challenge => "challenge",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "question" => Ok(ContentKind::Question),
            "challenge" => Ok(ContentKind::Challenge),
            other => Err(Error::Config(format!("unknown content kind: {}", other))),
        }
    }
}

/// One day's content for a pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyContent {
    pub pairing_id: String,
    pub day: NaiveDate,
    pub kind: ContentKind,
    /// Remote document id
    pub content_id: String,
    pub payload: Value,
    pub cached_at: DateTime<Utc>,
}

/// Content cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentCacheConfig {
    /// Days of content kept, counted back from today
    pub retention_days: u32,
    /// Sweeper period
    #[serde(with = "secs")]
    pub sweep_interval: Duration,
    /// Remote collection holding daily questions
    pub question_collection: String,
    /// Remote collection holding daily challenges
    pub challenge_collection: String,
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            sweep_interval: Duration::from_secs(6 * 3600),
            question_collection: "dailyQuestions".to_string(),
            challenge_collection: "dailyChallenges".to_string(),
        }
    }
}

/// Row as stored, before payload decoding
struct StoredRow {
    day: String,
    content_id: String,
    payload: String,
    cached_at: i64,
}

/// Daily content cache
pub struct ContentCache {
    store: Arc<SqliteStore>,
    documents: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: ContentCacheConfig,
    counters: CacheCounters,
    feed: ChangeFeed,
}

impl ContentCache {
    pub fn new(
        store: Arc<SqliteStore>,
        documents: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: ContentCacheConfig,
    ) -> Self {
        Self {
            store,
            documents,
            clock,
            config,
            counters: CacheCounters::new(),
            feed: ChangeFeed::default(),
        }
    }

    /// Insert or replace a record. A record older (by `cached_at`) than the
    /// stored one is ignored; returns whether the row was written.
    #[instrument(skip(self, record), fields(kind = %record.kind, pairing_id = %record.pairing_id, day = %record.day))]
    pub async fn upsert(&self, record: &DailyContent) -> Result<bool> {
        let payload = serde_json::to_string(&record.payload)?;
        let changed = {
            let conn = self.store.lock().await;
            conn.execute(
                "INSERT INTO daily_content (kind, pairing_id, day, content_id, payload, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(kind, pairing_id, day) DO UPDATE SET
                    content_id = excluded.content_id,
                    payload = excluded.payload,
                    cached_at = excluded.cached_at
                 WHERE excluded.cached_at >= daily_content.cached_at",
                params![
                    record.kind.as_str(),
                    record.pairing_id,
                    record.day.format(DAY_FORMAT).to_string(),
                    record.content_id,
                    payload,
                    record.cached_at.timestamp_millis(),
                ],
            )?
        };

        if changed == 0 {
            debug!("Ignoring upsert older than stored row");
            return Ok(false);
        }
        self.counters.record_write();
        self.feed.publish(CacheEvent::ContentUpdated {
            pairing_id: record.pairing_id.clone(),
            day: record.day.format(DAY_FORMAT).to_string(),
            kind: record.kind.to_string(),
        });
        Ok(true)
    }

    /// Content for one day. Storage errors degrade to a miss.
    #[instrument(skip(self))]
    pub async fn get_for_day(
        &self,
        kind: ContentKind,
        pairing_id: &str,
        day: NaiveDate,
    ) -> Option<DailyContent> {
        match self.load_for_day(kind, pairing_id, day).await {
            Ok(Some(record)) => {
                self.counters.record_hit();
                Some(record)
            }
            Ok(None) => {
                self.counters.record_miss(MissReason::NotFound);
                None
            }
            Err(Error::CorruptRecord { key, .. }) => {
                warn!(key, "Corrupt daily content deleted");
                self.counters.record_miss(MissReason::Corrupt);
                None
            }
            Err(e) => {
                warn!(error = %e, "Daily content read failed");
                self.counters.record_storage_failure();
                None
            }
        }
    }

    async fn load_for_day(
        &self,
        kind: ContentKind,
        pairing_id: &str,
        day: NaiveDate,
    ) -> Result<Option<DailyContent>> {
        let day_str = day.format(DAY_FORMAT).to_string();
        let row = {
            let conn = self.store.lock().await;
            conn.query_row(
                "SELECT day, content_id, payload, cached_at FROM daily_content
                 WHERE kind = ?1 AND pairing_id = ?2 AND day = ?3",
                params![kind.as_str(), pairing_id, day_str],
                |row| {
                    Ok(StoredRow {
                        day: row.get(0)?,
                        content_id: row.get(1)?,
                        payload: row.get(2)?,
                        cached_at: row.get(3)?,
                    })
                },
            )
            .optional()?
        };

        match row {
            Some(row) => self.decode_or_delete(kind, pairing_id, row).await.map(Some),
            None => Ok(None),
        }
    }

    /// Most recent records, newest day first. Corrupt rows are deleted and
    /// skipped; storage errors degrade to an empty list.
    #[instrument(skip(self))]
    pub async fn get_recent(&self, kind: ContentKind, pairing_id: &str, limit: usize) -> Vec<DailyContent> {
        let rows = {
            let conn = self.store.lock().await;
            let result = conn
                .prepare(
                    "SELECT day, content_id, payload, cached_at FROM daily_content
                     WHERE kind = ?1 AND pairing_id = ?2
                     ORDER BY day DESC LIMIT ?3",
                )
                .and_then(|mut stmt| {
                    let rows = stmt
                        .query_map(params![kind.as_str(), pairing_id, limit as i64], |row| {
                            Ok(StoredRow {
                                day: row.get(0)?,
                                content_id: row.get(1)?,
                                payload: row.get(2)?,
                                cached_at: row.get(3)?,
                            })
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>();
                    rows
                });
            match result {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "Recent daily content read failed");
                    self.counters.record_storage_failure();
                    return Vec::new();
                }
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match self.decode_or_delete(kind, pairing_id, row).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable daily content");
                    self.counters.record_miss(MissReason::Corrupt);
                }
            }
        }
        records
    }

    async fn decode_or_delete(
        &self,
        kind: ContentKind,
        pairing_id: &str,
        row: StoredRow,
    ) -> Result<DailyContent> {
        let decoded = (|| {
            let day = NaiveDate::parse_from_str(&row.day, DAY_FORMAT).ok()?;
            let payload: Value = serde_json::from_str(&row.payload).ok()?;
            let cached_at = DateTime::<Utc>::from_timestamp_millis(row.cached_at)?;
            Some((day, payload, cached_at))
        })();

        match decoded {
            Some((day, payload, cached_at)) => Ok(DailyContent {
                pairing_id: pairing_id.to_string(),
                day,
                kind,
                content_id: row.content_id,
                payload,
                cached_at,
            }),
            None => {
                let conn = self.store.lock().await;
                conn.execute(
                    "DELETE FROM daily_content WHERE kind = ?1 AND pairing_id = ?2 AND day = ?3",
                    params![kind.as_str(), pairing_id, row.day],
                )?;
                Err(Error::CorruptRecord {
                    component: "content".to_string(),
                    key: format!("{}/{}/{}", kind, pairing_id, row.day),
                })
            }
        }
    }

    /// Fetch one day's content from the remote store and cache it.
    ///
    /// Returns `None` when the remote has no document for that day.
    #[instrument(skip(self))]
    pub async fn refresh_from_remote(
        &self,
        kind: ContentKind,
        pairing_id: &str,
        day: NaiveDate,
    ) -> Result<Option<DailyContent>> {
        let collection = match kind {
            ContentKind::Question => &self.config.question_collection,
            ContentKind::Challenge => &self.config.challenge_collection,
        };
        let filter = QueryFilter::And(vec![
            QueryFilter::equals("pairingId", pairing_id),
            QueryFilter::equals("day", day.format(DAY_FORMAT).to_string()),
        ]);

        self.counters.record_remote_call();
        let snapshot = self
            .documents
            .read_once(collection, filter)
            .await
            .inspect_err(|_| self.counters.record_remote_failure())?;

        let Some(document) = snapshot.documents.into_iter().next() else {
            debug!("No remote content for day");
            return Ok(None);
        };

        let record = DailyContent {
            pairing_id: pairing_id.to_string(),
            day,
            kind,
            content_id: document.id,
            payload: document.fields,
            cached_at: self.clock.now(),
        };
        if let Err(e) = self.upsert(&record).await {
            // The fetched value is still returned to the caller
            warn!(error = %e, "Failed to cache fetched daily content");
            self.counters.record_storage_failure();
        }
        Ok(Some(record))
    }

    /// Delete rows older than the retention window
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<u64> {
        let today = self.clock.now().date_naive();
        let cutoff = today - chrono::Duration::days(self.config.retention_days as i64);
        let removed = {
            let conn = self.store.lock().await;
            conn.execute(
                "DELETE FROM daily_content WHERE day < ?1",
                params![cutoff.format(DAY_FORMAT).to_string()],
            )? as u64
        };

        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Purged expired daily content");
            self.counters.record_evictions(removed);
            self.feed.publish(CacheEvent::ContentPurged { removed });
        }
        Ok(removed)
    }

    /// Run [`ContentCache::purge_expired`] every `period` until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        spawn_periodic("content-sweeper", period, token, move || {
            let cache = Arc::clone(&cache);
            async move { cache.purge_expired().await.map(|_| ()) }
        })
    }

    /// Configured sweeper period
    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }

    /// Delete every row
    pub async fn clear(&self) -> Result<u64> {
        let removed = {
            let conn = self.store.lock().await;
            conn.execute("DELETE FROM daily_content", [])? as u64
        };
        self.feed.publish(CacheEvent::Cleared {
            component: "content".to_string(),
        });
        Ok(removed)
    }

    /// Number of cached rows
    pub async fn len(&self) -> Result<u64> {
        let conn = self.store.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM daily_content", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub async fn metrics(&self) -> ComponentMetrics {
        let entries = self.len().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to count daily content");
            0
        });
        self.counters.snapshot(entries, 0)
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
    use crate::adapters::InMemoryDocumentStore;
    use crate::clock::ManualClock;
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Fixture {
        cache: Arc<ContentCache>,
        store: Arc<SqliteStore>,
        documents: Arc<InMemoryDocumentStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let clock = ManualClock::new("2026-03-15T09:00:00Z".parse().unwrap());
        let cache = Arc::new(ContentCache::new(
            Arc::clone(&store),
            documents.clone(),
            clock.clone(),
            ContentCacheConfig::default(),
        ));
        Fixture {
            cache,
            store,
            documents,
            clock,
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DAY_FORMAT).unwrap()
    }

    fn make_record(kind: ContentKind, d: &str, id: &str, cached_at: DateTime<Utc>) -> DailyContent {
        DailyContent {
            pairing_id: "p1".to_string(),
            day: day(d),
            kind,
            content_id: id.to_string(),
            payload: json!({"text": id}),
            cached_at,
        }
    }

    #[tokio::test]
    async fn test_upsert_then_get_for_day() {
        let f = fixture();
        let now = f.clock.now();
        let record = make_record(ContentKind::Question, "2026-03-15", "q1", now);

        assert!(f.cache.upsert(&record).await.unwrap());
        assert_eq!(
            f.cache.get_for_day(ContentKind::Question, "p1", day("2026-03-15")).await,
            Some(record)
        );
        // Same day, other kind is independent
        assert!(f.cache.get_for_day(ContentKind::Challenge, "p1", day("2026-03-15")).await.is_none());
    }

    #[tokio::test]
    async fn test_older_upsert_is_ignored() {
        let f = fixture();
        let now = f.clock.now();
        let newer = make_record(ContentKind::Question, "2026-03-15", "q-new", now);
        let older = make_record(ContentKind::Question, "2026-03-15", "q-old", now - chrono::Duration::minutes(5));

        assert!(f.cache.upsert(&newer).await.unwrap());
        assert!(!f.cache.upsert(&older).await.unwrap());

        let stored = f.cache.get_for_day(ContentKind::Question, "p1", day("2026-03-15")).await.unwrap();
        assert_eq!(stored.content_id, "q-new");
    }

    #[tokio::test]
    async fn test_get_recent_newest_first() {
        let f = fixture();
        let now = f.clock.now();
        for d in ["2026-03-12", "2026-03-14", "2026-03-13"] {
            f.cache.upsert(&make_record(ContentKind::Challenge, d, d, now)).await.unwrap();
        }

        let recent = f.cache.get_recent(ContentKind::Challenge, "p1", 2).await;
        let days: Vec<String> = recent.iter().map(|r| r.day.to_string()).collect();
        assert_eq!(days, vec!["2026-03-14", "2026-03-13"]);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_deleted() {
        let f = fixture();
        {
            let conn = f.store.lock().await;
            conn.execute(
                "INSERT INTO daily_content VALUES ('question', 'p1', '2026-03-15', 'q1', '{not json', 0)",
                [],
            )
            .unwrap();
        }

        assert!(f.cache.get_for_day(ContentKind::Question, "p1", day("2026-03-15")).await.is_none());
        assert_eq!(f.cache.len().await.unwrap(), 0);
        assert_eq!(f.cache.metrics().await.misses_corrupt, 1);
    }

    #[tokio::test]
    async fn test_purge_expired_uses_retention_window() {
        let f = fixture();
        let now = f.clock.now();
        f.cache.upsert(&make_record(ContentKind::Question, "2026-02-10", "old", now)).await.unwrap();
        f.cache.upsert(&make_record(ContentKind::Question, "2026-02-13", "edge", now)).await.unwrap();
        f.cache.upsert(&make_record(ContentKind::Question, "2026-03-15", "today", now)).await.unwrap();

        // Cutoff is 2026-02-13: strictly older rows go
        assert_eq!(f.cache.purge_expired().await.unwrap(), 1);
        assert_eq!(f.cache.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_refresh_from_remote_populates_cache() {
        let f = fixture();
        f.documents.seed(
            "dailyQuestions",
            "q-42",
            json!({"pairingId": "p1", "day": "2026-03-15", "text": "What made you smile?"}),
        );

        let fetched = f
            .cache
            .refresh_from_remote(ContentKind::Question, "p1", day("2026-03-15"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.content_id, "q-42");

        let cached = f.cache.get_for_day(ContentKind::Question, "p1", day("2026-03-15")).await;
        assert_eq!(cached.map(|c| c.content_id), Some("q-42".to_string()));

        // Nothing for tomorrow
        let none = f
            .cache
            .refresh_from_remote(ContentKind::Question, "p1", day("2026-03-16"))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_refresh_from_remote_surfaces_failure() {
        let f = fixture();
        f.documents.set_fail_reads(true);

        let result = f
            .cache
            .refresh_from_remote(ContentKind::Challenge, "p1", day("2026-03-15"))
            .await;
        assert_matches!(result, Err(Error::Remote { .. }));
        assert_eq!(f.cache.counters().remote_failures(), 1);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in ContentKind::ALL {
            assert_eq!(kind.as_str().parse::<ContentKind>().unwrap(), kind);
        }
        assert!("poll".parse::<ContentKind>().is_err());
    }
}
