//! Hybrid Realtime Cache
//!
//! Local mirror of a partner-shared remote collection, kept in step with a
//! live subscription. The remote store is authoritative:
//!
//! 1. each snapshot replaces the observable view outright
//! 2. the persisted mirror is diffed against the snapshot ids
//! 3. rows no longer visible are deleted
//! 4. newly visible rows are inserted and rows whose `updated_at` moved are
//!    rewritten
//!
//! Local `add`/`remove` go to the remote store first and only show up in the
//! persisted mirror when the next snapshot arrives. Until then they appear
//! in the view with a [`RecordState`] so the UI can render them as pending.
//!
//! Reconciliations are serialized per pairing. A snapshot that arrives while
//! another is being reconciled supersedes any older one still waiting.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::SqliteStore;
use crate::cache::metrics::{CacheCounters, ComponentMetrics, MissReason};
use crate::clock::Clock;
use crate::domain::ports::{timestamp_value, DocumentStore, QueryFilter, RemoteDocument, Snapshot};
use crate::domain::{CacheEvent, ChangeFeed};
use crate::error::{Error, Result};

const FIELD_AUTHOR: &str = "authorId";
const FIELD_PARTNERS: &str = "partnerIds";
const FIELD_UPDATED: &str = "updatedAt";
const FIELD_PAIRING: &str = "pairingId";

// =============================================================================
// Records
// =============================================================================

/// A record of the shared collection, in local shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedRecord {
    pub id: String,
    pub owner_author_id: String,
    pub partner_ids: Vec<String>,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl SharedRecord {
    /// Translate a remote document. Returns `None` if a required field is
    /// missing or malformed.
    pub fn from_remote(doc: &RemoteDocument) -> Option<Self> {
        let owner_author_id = doc.str_field(FIELD_AUTHOR)?.to_string();
        let partner_ids = doc
            .fields
            .get(FIELD_PARTNERS)?
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        let updated_at = parse_timestamp(doc.fields.get(FIELD_UPDATED)?)?;

        let mut payload = doc.fields.clone();
        if let Value::Object(map) = &mut payload {
            for field in [FIELD_AUTHOR, FIELD_PARTNERS, FIELD_UPDATED, FIELD_PAIRING] {
                map.remove(field);
            }
        }

        Some(Self {
            id: doc.id.clone(),
            owner_author_id,
            partner_ids,
            payload,
            updated_at,
        })
    }

    /// New record with a generated id. `updated_at` is stamped by
    /// [`RealtimeCache::add`].
    pub fn draft(owner_author_id: impl Into<String>, partner_ids: Vec<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_author_id: owner_author_id.into(),
            partner_ids,
            payload,
            updated_at: DateTime::<Utc>::default(),
        }
    }

    /// Remote shape of this record
    pub fn to_fields(&self, pairing_id: &str) -> Value {
        let mut fields = match &self.payload {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        fields.insert(FIELD_AUTHOR.to_string(), Value::String(self.owner_author_id.clone()));
        fields.insert(
            FIELD_PARTNERS.to_string(),
            Value::Array(self.partner_ids.iter().cloned().map(Value::String).collect()),
        );
        fields.insert(FIELD_UPDATED.to_string(), timestamp_value(self.updated_at));
        fields.insert(FIELD_PAIRING.to_string(), Value::String(pairing_id.to_string()));
        Value::Object(fields)
    }
}

/// Accepts RFC 3339 strings or epoch milliseconds
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

/// Confirmation state of an item in the view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// Written locally, waiting for the remote snapshot to reflect it
    Pending,
    /// Reflected by the remote snapshot
    Confirmed,
    /// Remote write failed; dismiss or retry
    Failed,
}

/// One entry of the observable view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewItem {
    pub record: SharedRecord,
    pub state: RecordState,
    /// True for a pending or failed removal
    pub removing: bool,
}

/// Realtime cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Remote collection mirrored by this cache
    pub collection: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            collection: "sharedItems".to_string(),
        }
    }
}

// =============================================================================
// Per-pairing state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Upsert,
    Remove,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    op: PendingOp,
    record: SharedRecord,
    state: RecordState,
    /// Newest snapshot generation when the remote accepted the write
    acked_at: Option<u64>,
}

#[derive(Default)]
struct RemoteView {
    generation: u64,
    records: Vec<SharedRecord>,
}

struct PairingState {
    view: watch::Sender<Vec<ViewItem>>,
    remote: Mutex<RemoteView>,
    pending: Mutex<BTreeMap<String, PendingWrite>>,
    /// Generation of the newest snapshot that has arrived
    latest: AtomicU64,
    reconcile: tokio::sync::Mutex<()>,
    listener: Mutex<Option<CancellationToken>>,
}

impl PairingState {
    fn new() -> Self {
        let (view, _rx) = watch::channel(Vec::new());
        Self {
            view,
            remote: Mutex::new(RemoteView::default()),
            pending: Mutex::new(BTreeMap::new()),
            latest: AtomicU64::new(0),
            reconcile: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
        }
    }

    /// Recompose the view from the last remote records and pending writes
    fn publish_view(&self) {
        let remote = self.remote.lock();
        let pending = self.pending.lock();
        self.view
            .send_replace(compose_view(&remote.records, &pending));
    }
}

fn compose_view(remote: &[SharedRecord], pending: &BTreeMap<String, PendingWrite>) -> Vec<ViewItem> {
    let mut items: BTreeMap<String, ViewItem> = remote
        .iter()
        .map(|r| {
            (
                r.id.clone(),
                ViewItem {
                    record: r.clone(),
                    state: RecordState::Confirmed,
                    removing: false,
                },
            )
        })
        .collect();

    for (id, write) in pending {
        match write.op {
            PendingOp::Upsert => {
                items.insert(
                    id.clone(),
                    ViewItem {
                        record: write.record.clone(),
                        state: write.state,
                        removing: false,
                    },
                );
            }
            PendingOp::Remove => {
                if let Some(item) = items.get_mut(id) {
                    item.state = write.state;
                    item.removing = true;
                }
            }
        }
    }
    items.into_values().collect()
}

/// Drop pending writes the snapshot of `generation` has settled. After the
/// remote accepts a write, the next snapshot is authoritative for it.
fn settle_pending(pending: &mut BTreeMap<String, PendingWrite>, remote: &[SharedRecord], generation: u64) {
    let visible: HashMap<&str, &SharedRecord> = remote.iter().map(|r| (r.id.as_str(), r)).collect();
    pending.retain(|id, write| {
        if write.state == RecordState::Failed {
            return true;
        }
        if write.acked_at.is_some_and(|acked| generation > acked) {
            return false;
        }
        match (write.op, visible.get(id.as_str())) {
            (PendingOp::Upsert, Some(r)) => r.updated_at < write.record.updated_at,
            (PendingOp::Upsert, None) => true,
            (PendingOp::Remove, Some(_)) => true,
            (PendingOp::Remove, None) => false,
        }
    });
}

/// Counts of one reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    /// A newer snapshot arrived first; persistence was left to it
    pub superseded: bool,
}

// =============================================================================
// Cache
// =============================================================================

/// Hybrid realtime cache
pub struct RealtimeCache {
    store: Arc<SqliteStore>,
    documents: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: RealtimeConfig,
    pairings: DashMap<String, Arc<PairingState>>,
    listeners: TaskTracker,
    counters: CacheCounters,
    feed: ChangeFeed,
}

impl RealtimeCache {
    pub fn new(
        store: Arc<SqliteStore>,
        documents: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: RealtimeConfig,
    ) -> Self {
        Self {
            store,
            documents,
            clock,
            config,
            pairings: DashMap::new(),
            listeners: TaskTracker::new(),
            counters: CacheCounters::new(),
            feed: ChangeFeed::default(),
        }
    }

    fn pairing(&self, pairing_id: &str) -> Arc<PairingState> {
        Arc::clone(
            self.pairings
                .entry(pairing_id.to_string())
                .or_insert_with(|| Arc::new(PairingState::new()))
                .value(),
        )
    }

    /// Observe the view of one pairing
    pub fn subscribe(&self, pairing_id: &str) -> watch::Receiver<Vec<ViewItem>> {
        self.pairing(pairing_id).view.subscribe()
    }

    /// Current view of one pairing
    pub fn view(&self, pairing_id: &str) -> Vec<ViewItem> {
        self.pairing(pairing_id).view.borrow().clone()
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Apply one remote snapshot to the view and the persisted mirror
    #[instrument(skip(self, snapshot), fields(documents = snapshot.documents.len()))]
    pub async fn apply_snapshot(&self, pairing_id: &str, snapshot: Snapshot) -> ReconcileOutcome {
        let state = self.pairing(pairing_id);
        let generation = state.latest.fetch_add(1, Ordering::AcqRel) + 1;

        let mut records = Vec::with_capacity(snapshot.documents.len());
        for doc in &snapshot.documents {
            match SharedRecord::from_remote(doc) {
                Some(record) => records.push(record),
                None => {
                    warn!(id = %doc.id, "Skipping untranslatable remote document");
                    self.counters.record_miss(MissReason::Corrupt);
                }
            }
        }

        // (1) The view follows the newest snapshot unconditionally
        {
            let mut remote = state.remote.lock();
            if generation > remote.generation {
                remote.generation = generation;
                remote.records = records.clone();
                let mut pending = state.pending.lock();
                settle_pending(&mut pending, &remote.records, generation);
                state.view.send_replace(compose_view(&remote.records, &pending));
            }
        }

        // (2)-(4) Persisted mirror, one reconciliation at a time
        let _guard = state.reconcile.lock().await;
        if state.latest.load(Ordering::Acquire) > generation {
            debug!(generation, "Snapshot superseded before reconciliation");
            return ReconcileOutcome {
                superseded: true,
                ..Default::default()
            };
        }

        match self.reconcile_mirror(pairing_id, &records).await {
            Ok(outcome) => {
                self.counters.record_write();
                if outcome.inserted + outcome.updated + outcome.removed > 0 {
                    debug!(
                        inserted = outcome.inserted,
                        updated = outcome.updated,
                        removed = outcome.removed,
                        "Mirror reconciled"
                    );
                }
                self.feed.publish(CacheEvent::MirrorReconciled {
                    pairing_id: pairing_id.to_string(),
                    inserted: outcome.inserted,
                    updated: outcome.updated,
                    removed: outcome.removed,
                });
                outcome
            }
            Err(e) => {
                warn!(error = %e, "Mirror reconciliation failed, view only");
                self.counters.record_storage_failure();
                ReconcileOutcome::default()
            }
        }
    }

    async fn reconcile_mirror(&self, pairing_id: &str, records: &[SharedRecord]) -> Result<ReconcileOutcome> {
        let mut conn = self.store.lock().await;
        let tx = conn.transaction()?;

        let persisted: HashMap<String, i64> = {
            let mut stmt = tx.prepare("SELECT id, updated_at FROM shared_mirror WHERE pairing_id = ?1")?;
            let rows = stmt
                .query_map(params![pairing_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<HashMap<_, _>>>()?;
            rows
        };
        let visible: BTreeSet<&str> = records.iter().map(|r| r.id.as_str()).collect();

        let mut outcome = ReconcileOutcome::default();
        for id in persisted.keys() {
            if !visible.contains(id.as_str()) {
                tx.execute(
                    "DELETE FROM shared_mirror WHERE pairing_id = ?1 AND id = ?2",
                    params![pairing_id, id],
                )?;
                outcome.removed += 1;
            }
        }

        for record in records {
            let updated_at = record.updated_at.timestamp_millis();
            match persisted.get(&record.id) {
                Some(stored) if *stored == updated_at => continue,
                Some(_) => outcome.updated += 1,
                None => outcome.inserted += 1,
            }
            tx.execute(
                "INSERT OR REPLACE INTO shared_mirror
                    (pairing_id, id, owner_author_id, partner_ids, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    pairing_id,
                    record.id,
                    record.owner_author_id,
                    serde_json::to_string(&record.partner_ids)?,
                    serde_json::to_string(&record.payload)?,
                    updated_at,
                ],
            )?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Persisted mirror of one pairing, ordered by id
    pub async fn mirror(&self, pairing_id: &str) -> Result<Vec<SharedRecord>> {
        let conn = self.store.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, owner_author_id, partner_ids, payload, updated_at FROM shared_mirror
             WHERE pairing_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![pairing_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, owner_author_id, partner_ids, payload, updated_at) in rows {
            let decoded = serde_json::from_str(&partner_ids)
                .ok()
                .zip(serde_json::from_str(&payload).ok())
                .zip(DateTime::<Utc>::from_timestamp_millis(updated_at));
            match decoded {
                Some(((partner_ids, payload), updated_at)) => records.push(SharedRecord {
                    id,
                    owner_author_id,
                    partner_ids,
                    payload,
                    updated_at,
                }),
                None => {
                    // Dropped here; the next snapshot re-inserts it
                    warn!(id, "Corrupt mirror row deleted");
                    self.counters.record_miss(MissReason::Corrupt);
                    conn.execute(
                        "DELETE FROM shared_mirror WHERE pairing_id = ?1 AND id = ?2",
                        params![pairing_id, id],
                    )?;
                }
            }
        }
        Ok(records)
    }

    /// Ids in the persisted mirror
    pub async fn mirror_ids(&self, pairing_id: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .mirror(pairing_id)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect())
    }

    /// Seed the view from the persisted mirror, for use before the first
    /// remote snapshot arrives. Returns the number of records loaded.
    pub async fn preload(&self, pairing_id: &str) -> Result<usize> {
        let records = self.mirror(pairing_id).await?;
        let count = records.len();
        let state = self.pairing(pairing_id);
        {
            let mut remote = state.remote.lock();
            // Only when no snapshot has been applied yet
            if remote.generation == 0 {
                remote.records = records;
            }
        }
        state.publish_view();
        Ok(count)
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    /// Create or update a record. The remote write happens first; the
    /// persisted mirror changes only when the next snapshot arrives.
    #[instrument(skip(self, record), fields(id = %record.id))]
    pub async fn add(&self, pairing_id: &str, mut record: SharedRecord) -> Result<()> {
        record.updated_at = self.clock.now();
        let state = self.pairing(pairing_id);
        let id = record.id.clone();
        let fields = record.to_fields(pairing_id);

        state.pending.lock().insert(
            id.clone(),
            PendingWrite {
                op: PendingOp::Upsert,
                record,
                state: RecordState::Pending,
                acked_at: None,
            },
        );
        state.publish_view();

        self.counters.record_remote_call();
        let result = self
            .documents
            .write(&self.config.collection, &id, fields)
            .await;
        self.finish_write(&state, &id, result)
    }

    /// Delete a record remotely
    #[instrument(skip(self))]
    pub async fn remove(&self, pairing_id: &str, id: &str) -> Result<()> {
        let state = self.pairing(pairing_id);
        let existing = state
            .remote
            .lock()
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned();

        if let Some(record) = existing {
            state.pending.lock().insert(
                id.to_string(),
                PendingWrite {
                    op: PendingOp::Remove,
                    record,
                    state: RecordState::Pending,
                    acked_at: None,
                },
            );
            state.publish_view();
        }

        self.counters.record_remote_call();
        let result = self.documents.delete(&self.config.collection, id).await;
        self.finish_write(&state, id, result)
    }

    fn finish_write(&self, state: &PairingState, id: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                if let Some(write) = state.pending.lock().get_mut(id) {
                    write.acked_at = Some(state.latest.load(Ordering::Acquire));
                }
                Ok(())
            }
            Err(e) => {
                warn!(id, error = %e, "Remote write failed");
                self.counters.record_remote_failure();
                if let Some(write) = state.pending.lock().get_mut(id) {
                    write.state = RecordState::Failed;
                }
                state.publish_view();
                Err(match e {
                    Error::Remote { .. } => e,
                    other => Error::remote("shared write", other.to_string()),
                })
            }
        }
    }

    /// Forget a failed local write
    pub fn dismiss_failed(&self, pairing_id: &str, id: &str) -> bool {
        let state = self.pairing(pairing_id);
        let removed = {
            let mut pending = state.pending.lock();
            match pending.get(id) {
                Some(write) if write.state == RecordState::Failed => pending.remove(id).is_some(),
                _ => false,
            }
        };
        if removed {
            state.publish_view();
        }
        removed
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Start the live subscription for a pairing. The view is first seeded
    /// from the persisted mirror. No-op if already running.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, pairing_id: &str, user_id: &str) -> Result<()> {
        let state = self.pairing(pairing_id);
        if state.listener.lock().is_some() {
            debug!("Listener already running");
            return Ok(());
        }

        if let Err(e) = self.preload(pairing_id).await {
            warn!(error = %e, "Failed to seed view from mirror");
            self.counters.record_storage_failure();
        }

        let filter = QueryFilter::And(vec![
            QueryFilter::equals(FIELD_PAIRING, pairing_id),
            QueryFilter::array_contains(FIELD_PARTNERS, user_id),
        ]);
        self.counters.record_remote_call();
        let mut stream = self
            .documents
            .subscribe(&self.config.collection, filter)
            .await
            .inspect_err(|_| self.counters.record_remote_failure())?;

        let token = CancellationToken::new();
        {
            let mut listener = state.listener.lock();
            if listener.is_some() {
                return Ok(());
            }
            *listener = Some(token.clone());
        }

        let cache = Arc::clone(self);
        let pairing_id = pairing_id.to_string();
        self.listeners.spawn(async move {
            info!(pairing_id, "Realtime listener started");
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(snapshot)) => {
                            cache.apply_snapshot(&pairing_id, snapshot).await;
                        }
                        Some(Err(e)) => {
                            warn!(pairing_id, error = %e, "Realtime listener error");
                            cache.counters.record_remote_failure();
                        }
                        None => {
                            warn!(pairing_id, "Realtime stream ended");
                            break;
                        }
                    }
                }
            }
            // A cancelled token was already taken by `stop`
            if !token.is_cancelled() {
                if let Some(state) = cache.pairings.get(&pairing_id) {
                    state.listener.lock().take();
                }
            }
            info!(pairing_id, "Realtime listener stopped");
        });
        Ok(())
    }

    /// Stop the live subscription for a pairing
    pub fn stop(&self, pairing_id: &str) {
        if let Some(state) = self.pairings.get(pairing_id) {
            if let Some(token) = state.listener.lock().take() {
                token.cancel();
            }
        }
    }

    /// Stop every listener and wait for them to exit
    pub async fn stop_all(&self) {
        for state in self.pairings.iter() {
            if let Some(token) = state.listener.lock().take() {
                token.cancel();
            }
        }
        self.listeners.close();
        self.listeners.wait().await;
        self.listeners.reopen();
    }

    /// True if a listener is running for the pairing
    pub fn is_listening(&self, pairing_id: &str) -> bool {
        self.pairings
            .get(pairing_id)
            .is_some_and(|s| s.listener.lock().is_some())
    }

    /// Stop all listeners, empty every view, and delete the mirror
    pub async fn clear(&self) -> Result<()> {
        self.stop_all().await;
        let states: Vec<Arc<PairingState>> = self
            .pairings
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for state in states {
            let _guard = state.reconcile.lock().await;
            // Anything still queued is now stale
            state.latest.fetch_add(1, Ordering::AcqRel);
            {
                let mut remote = state.remote.lock();
                remote.generation = state.latest.load(Ordering::Acquire);
                remote.records.clear();
            }
            state.pending.lock().clear();
            state.publish_view();
        }
        {
            let conn = self.store.lock().await;
            conn.execute("DELETE FROM shared_mirror", [])?;
        }
        self.feed.publish(CacheEvent::Cleared {
            component: "realtime".to_string(),
        });
        Ok(())
    }

    pub async fn metrics(&self) -> ComponentMetrics {
        let entries = {
            let conn = self.store.lock().await;
            conn.query_row("SELECT COUNT(*) FROM shared_mirror", [], |row| row.get::<_, i64>(0))
        };
        let entries = entries.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to count mirror rows");
            0
        });
        self.counters.snapshot(entries.max(0) as u64, 0)
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
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
    use proptest::prelude::*;
    use serde_json::json;

    fn make_cache() -> (Arc<RealtimeCache>, Arc<InMemoryDocumentStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let cache = Arc::new(RealtimeCache::new(
            store,
            documents.clone(),
            ManualClock::starting_now(),
            RealtimeConfig::default(),
        ));
        (cache, documents)
    }

    fn make_doc(id: &str, updated_ms: i64) -> RemoteDocument {
        RemoteDocument::new(
            id,
            json!({
                "authorId": "u1",
                "partnerIds": ["u1", "u2"],
                "pairingId": "p1",
                "updatedAt": updated_ms,
                "title": format!("item {}", id),
            }),
        )
    }

    fn make_snapshot(ids: &[&str]) -> Snapshot {
        Snapshot::new("sharedItems", ids.iter().map(|id| make_doc(id, 1_000)).collect())
    }

    fn ids(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_record_translation() {
        let record = SharedRecord::from_remote(&make_doc("a", 1_700_000_000_000)).unwrap();
        assert_eq!(record.owner_author_id, "u1");
        assert_eq!(record.partner_ids, vec!["u1", "u2"]);
        assert_eq!(record.payload, json!({"title": "item a"}));

        let fields = record.to_fields("p1");
        assert_eq!(fields["pairingId"], json!("p1"));
        let back = SharedRecord::from_remote(&RemoteDocument::new("a", fields)).unwrap();
        assert_eq!(back, record);

        assert!(SharedRecord::from_remote(&RemoteDocument::new("bad", json!({"title": 1}))).is_none());
    }

    #[tokio::test]
    async fn test_snapshot_replaces_mirror() {
        let (cache, _) = make_cache();

        cache.apply_snapshot("p1", make_snapshot(&["1", "2", "3"])).await;
        let outcome = cache.apply_snapshot("p1", make_snapshot(&["2", "3", "4"])).await;

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.removed, 1);
        assert_eq!(ids(&cache.mirror_ids("p1").await.unwrap()), vec!["2", "3", "4"]);
        let view: Vec<String> = cache.view("p1").into_iter().map(|i| i.record.id).collect();
        assert_eq!(view, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_moved_updated_at_rewrites_row() {
        let (cache, _) = make_cache();
        cache.apply_snapshot("p1", make_snapshot(&["1"])).await;

        let moved = Snapshot::new("sharedItems", vec![make_doc("1", 2_000)]);
        let outcome = cache.apply_snapshot("p1", moved).await;
        assert_eq!(outcome.updated, 1);

        // Same snapshot again changes nothing
        let again = Snapshot::new("sharedItems", vec![make_doc("1", 2_000)]);
        assert_eq!(cache.apply_snapshot("p1", again).await, ReconcileOutcome::default());
    }

    #[tokio::test]
    async fn test_failed_remote_write_leaves_mirror_untouched() {
        let (cache, documents) = make_cache();
        cache.apply_snapshot("p1", make_snapshot(&["1"])).await;
        documents.set_fail_writes(true);

        let record = SharedRecord::from_remote(&make_doc("2", 1_000)).unwrap();
        let result = cache.add("p1", record).await;
        assert_matches!(result, Err(Error::Remote { .. }));
        assert_eq!(ids(&cache.mirror_ids("p1").await.unwrap()), vec!["1"]);

        let failed: Vec<_> = cache.view("p1").into_iter().filter(|i| i.state == RecordState::Failed).collect();
        assert_eq!(failed.len(), 1);
        assert!(cache.dismiss_failed("p1", "2"));
        assert_eq!(cache.view("p1").len(), 1);
    }

    #[tokio::test]
    async fn test_add_is_pending_until_snapshot() {
        let (cache, documents) = make_cache();
        let record = SharedRecord::draft("u1", vec!["u1".into(), "u2".into()], json!({"title": "new"}));
        let id = record.id.clone();
        cache.add("p1", record).await.unwrap();

        assert_eq!(documents.write_count(), 1);
        assert_eq!(cache.view("p1")[0].state, RecordState::Pending);
        assert!(cache.mirror_ids("p1").await.unwrap().is_empty());

        let snapshot = documents.read_once("sharedItems", QueryFilter::All).await.unwrap();
        cache.apply_snapshot("p1", snapshot).await;
        assert_eq!(cache.view("p1")[0].state, RecordState::Confirmed);
        assert_eq!(ids(&cache.mirror_ids("p1").await.unwrap()), vec![id.as_str()]);
    }

    #[tokio::test]
    async fn test_accepted_add_deleted_remotely_leaves_view() {
        let (cache, documents) = make_cache();
        let record = SharedRecord::draft("u1", vec!["u1".into(), "u2".into()], json!({"title": "gone"}));
        let id = record.id.clone();
        cache.add("p1", record).await.unwrap();
        assert_eq!(cache.view("p1").len(), 1);

        // The partner deletes it before any snapshot reflected the add
        documents.delete("sharedItems", &id).await.unwrap();
        let snapshot = documents.read_once("sharedItems", QueryFilter::All).await.unwrap();
        cache.apply_snapshot("p1", snapshot).await;

        assert!(cache.view("p1").is_empty());
        assert!(cache.mirror_ids("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_add_survives_snapshot_before_acceptance() {
        let (cache, _documents) = make_cache();
        let record = SharedRecord::draft("u1", vec!["u1".into(), "u2".into()], json!({"title": "slow"}));
        let id = record.id.clone();
        let state = cache.pairing("p1");
        state.pending.lock().insert(
            id.clone(),
            PendingWrite {
                op: PendingOp::Upsert,
                record,
                state: RecordState::Pending,
                acked_at: None,
            },
        );

        cache.apply_snapshot("p1", make_snapshot(&[])).await;
        let view = cache.view("p1");
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].record.id, id);
        assert_eq!(view[0].state, RecordState::Pending);
    }

    #[tokio::test]
    async fn test_listener_converges_to_remote() {
        let (cache, documents) = make_cache();
        for id in ["1", "2", "3"] {
            documents.seed("sharedItems", id, make_doc(id, 1_000).fields);
        }
        let mut view = cache.subscribe("p1");
        cache.start("p1", "u2").await.unwrap();
        assert!(cache.is_listening("p1"));

        documents.delete("sharedItems", "1").await.unwrap();
        documents.write("sharedItems", "4", make_doc("4", 1_000).fields).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                view.changed().await.unwrap();
                let current: Vec<String> = view.borrow().iter().map(|i| i.record.id.clone()).collect();
                if current == ["2", "3", "4"] {
                    break;
                }
            }
        })
        .await
        .unwrap();

        cache.stop_all().await;
        assert!(!cache.is_listening("p1"));
        assert_eq!(ids(&cache.mirror_ids("p1").await.unwrap()), vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_clear_empties_views_and_mirror() {
        let (cache, _) = make_cache();
        cache.apply_snapshot("p1", make_snapshot(&["1", "2"])).await;

        cache.clear().await.unwrap();
        assert!(cache.view("p1").is_empty());
        assert!(cache.mirror_ids("p1").await.unwrap().is_empty());
        assert_eq!(cache.metrics().await.entries, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_mirror_converges_to_last_snapshot(
            snapshots in prop::collection::vec(prop::collection::btree_set(0u8..20, 0..12), 1..8)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (cache, _) = make_cache();
                for snapshot in &snapshots {
                    let names: Vec<String> = snapshot.iter().map(|n| n.to_string()).collect();
                    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                    cache.apply_snapshot("p1", make_snapshot(&refs)).await;
                }
                let expected: BTreeSet<String> =
                    snapshots.last().unwrap().iter().map(|n| n.to_string()).collect();
                assert_eq!(cache.mirror_ids("p1").await.unwrap(), expected);
            });
        }
    }
}
