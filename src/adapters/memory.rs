//! In-Memory Adapters
//!
//! DashMap-backed implementations of the remote ports. They are used by the
//! test suites and by the CLI, which operates on local data only. Each one
//! supports failure injection so degraded paths can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::domain::ports::{
    BlobStore, CallableFunctions, CallableResponse, DocumentStore, QueryFilter, RemoteDocument,
    SettingsStore, Snapshot,
};
use crate::error::{Error, Result};

// =============================================================================
// Document store
// =============================================================================

struct Subscription {
    collection: String,
    filter: QueryFilter,
    tx: mpsc::UnboundedSender<Result<Snapshot>>,
}

/// In-memory real-time document store.
///
/// Every write or delete pushes a fresh full-collection snapshot to each
/// matching live subscription, in write order.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    /// collection -> id -> fields
    collections: DashMap<String, DashMap<String, Value>>,
    subscriptions: Mutex<Vec<Subscription>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write/delete fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent read-once fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Number of successful writes and deletes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of read-once queries served
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Seed a document without notifying subscribers
    pub fn seed(&self, collection: &str, id: &str, fields: Value) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
    }

    fn snapshot(&self, collection: &str, filter: &QueryFilter) -> Snapshot {
        let mut documents: Vec<RemoteDocument> = self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| filter.matches(d.value()))
                    .map(|d| RemoteDocument::new(d.key().clone(), d.value().clone()))
                    .collect()
            })
            .unwrap_or_default();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        Snapshot::new(collection, documents)
    }

    fn notify(&self, collection: &str) {
        let mut subs = self.subscriptions.lock();
        subs.retain(|sub| {
            if sub.collection != collection {
                return !sub.tx.is_closed();
            }
            let snapshot = self.snapshot(collection, &sub.filter);
            sub.tx.send(Ok(snapshot)).is_ok()
        });
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::remote(operation, "write rejected"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn subscribe(
        &self,
        collection: &str,
        filter: QueryFilter,
    ) -> Result<BoxStream<'static, Result<Snapshot>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Initial snapshot, like a live listener's first callback
        let _ = tx.send(Ok(self.snapshot(collection, &filter)));
        self.subscriptions.lock().push(Subscription {
            collection: collection.to_string(),
            filter,
            tx,
        });
        debug!(collection, "Subscribed to in-memory collection");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn write(&self, collection: &str, id: &str, fields: Value) -> Result<()> {
        self.check_writable("write")?;
        self.seed(collection, id, fields);
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.notify(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.check_writable("delete")?;
        if let Some(docs) = self.collections.get(collection) {
            docs.remove(id);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.notify(collection);
        Ok(())
    }

    async fn read_once(&self, collection: &str, filter: QueryFilter) -> Result<Snapshot> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Error::remote("read_once", "unavailable"));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.snapshot(collection, &filter))
    }
}

// =============================================================================
// Blob store
// =============================================================================

/// In-memory object storage; URLs are `mem://<path>`
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: DashMap<String, Bytes>,
    downloads: AtomicU64,
    fail: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register bytes under an arbitrary URL
    pub fn insert(&self, url: impl Into<String>, bytes: impl Into<Bytes>) {
        self.objects.insert(url.into(), bytes.into());
    }

    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::remote(operation, "blob store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, path: &str, bytes: Bytes, _content_type: &str) -> Result<String> {
        self.check("upload")?;
        let url = format!("mem://{}", path.trim_start_matches('/'));
        self.objects.insert(url.clone(), bytes);
        Ok(url)
    }

    async fn download(&self, url: &str) -> Result<Bytes> {
        self.check("download")?;
        self.downloads.fetch_add(1, Ordering::Relaxed);
        self.objects
            .get(url)
            .map(|b| b.clone())
            .ok_or_else(|| Error::remote("download", format!("no object at {}", url)))
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.check("delete")?;
        self.objects.remove(url);
        Ok(())
    }
}

// =============================================================================
// Callable functions
// =============================================================================

type Handler = Arc<dyn Fn(&Value) -> Result<CallableResponse> + Send + Sync>;

/// Callable procedures answered by registered closures
#[derive(Default)]
pub struct InMemoryCallables {
    handlers: DashMap<String, Handler>,
    calls: DashMap<String, u64>,
}

impl InMemoryCallables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `name`
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> Result<CallableResponse> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// How many times `name` was invoked
    pub fn call_count(&self, name: &str) -> u64 {
        self.calls.get(name).map(|c| *c).unwrap_or(0)
    }

    /// Total invocations across every procedure
    pub fn total_calls(&self) -> u64 {
        self.calls.iter().map(|c| *c.value()).sum()
    }
}

#[async_trait]
impl CallableFunctions for InMemoryCallables {
    async fn call(&self, name: &str, args: Value) -> Result<CallableResponse> {
        *self.calls.entry(name.to_string()).or_insert(0) += 1;
        let handler = self
            .handlers
            .get(name)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| Error::remote(name, "no such function"))?;
        handler(&args)
    }
}

// =============================================================================
// Settings store
// =============================================================================

/// Volatile settings store
#[derive(Default)]
pub struct InMemorySettingsStore {
    values: DashMap<String, String>,
    fail_puts: AtomicBool,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Make every subsequent put fail
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::Relaxed);
    }

    /// Copy of every key/value pair
    pub fn dump(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[async_trait]
impl SettingsStore for InMemorySettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        if self.fail_puts.load(Ordering::Relaxed) {
            return Err(Error::storage("settings", "settings store unavailable"));
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<u64> {
        let before = self.values.len();
        self.values.retain(|k, _| !k.starts_with(prefix));
        Ok((before - self.values.len()) as u64)
    }
}

// =============================================================================
// Tests
// =============================================================================
