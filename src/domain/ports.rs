//! Domain Ports (Port/Adapter Pattern)
//!
//! Trait abstractions for every collaborator the cache layer consumes but
//! does not own: the remote document store, object storage, callable
//! procedures, the local settings store, the HTTP transport, and the
//! out-of-process widget surface. Adapters in [`crate::adapters`] implement
//! them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Cache Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  DocumentStore │ BlobStore │ CallableFunctions      │    │
//! │  │  SettingsStore │ HttpTransport │ SurfaceNotifier    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Adapters                              │
//! │  InMemoryDocumentStore │ FileSettingsStore │ ReqwestTransport│
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// A single document in a remote collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    /// Document identifier
    pub id: String,
    /// Document fields
    pub fields: Value,
}

impl RemoteDocument {
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Read a string field
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Full-collection snapshot as delivered by a live subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Collection name
    pub collection: String,
    /// Every document currently visible under the subscription's filter
    pub documents: Vec<RemoteDocument>,
}

impl Snapshot {
    pub fn new(collection: impl Into<String>, documents: Vec<RemoteDocument>) -> Self {
        Self {
            collection: collection.into(),
            documents,
        }
    }

    /// IDs visible in this snapshot
    pub fn ids(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.id.as_str()).collect()
    }
}

/// Simple predicate over document fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryFilter {
    /// Every document
    All,
    /// `fields[field] == value`
    Equals { field: String, value: Value },
    /// `fields[field]` is an array containing `value`
    ArrayContains { field: String, value: Value },
    /// Conjunction
    And(Vec<QueryFilter>),
}

impl QueryFilter {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryFilter::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        QueryFilter::ArrayContains {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Evaluate against a document's fields
    pub fn matches(&self, fields: &Value) -> bool {
        match self {
            QueryFilter::All => true,
            QueryFilter::Equals { field, value } => fields.get(field) == Some(value),
            QueryFilter::ArrayContains { field, value } => fields
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
            QueryFilter::And(filters) => filters.iter().all(|f| f.matches(fields)),
        }
    }
}

/// Result of a remote callable procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableResponse {
    /// Whether the procedure succeeded
    pub success: bool,
    /// Payload on success
    #[serde(default)]
    pub data: Value,
    /// Human-readable message on failure
    #[serde(default)]
    pub message: Option<String>,
}

impl CallableResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            message: Some(message.into()),
        }
    }
}

/// Out-of-process surfaces that render from exported snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Surface {
    /// Home-screen widget
    HomeWidget,
    /// Lock-screen widget
    LockScreen,
}

impl std::fmt::Display for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Surface::HomeWidget => write!(f, "home-widget"),
            Surface::LockScreen => write!(f, "lock-screen"),
        }
    }
}

/// Outbound HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method (only GET responses are cached)
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Request headers
    pub headers: BTreeMap<String, String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Path component of the URL (everything after the authority)
    pub fn path(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        match rest.find('/') {
            Some(idx) => {
                let path = &rest[idx..];
                path.split(['?', '#']).next().unwrap_or(path)
            }
            None => "/",
        }
    }
}

/// HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Encoded thumbnail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub bytes: Bytes,
    /// File extension without the dot
    pub extension: String,
}

// =============================================================================
// Ports
// =============================================================================

/// Remote real-time document store.
///
/// Used by the structured content cache (read-once population), the hybrid
/// realtime cache (live subscription + writes), and nothing else.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Subscribe to full-collection snapshots matching `filter`
    async fn subscribe(
        &self,
        collection: &str,
        filter: QueryFilter,
    ) -> Result<BoxStream<'static, Result<Snapshot>>>;

    /// Create or merge a document
    async fn write(&self, collection: &str, id: &str, fields: Value) -> Result<()>;

    /// Delete a document
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// One-shot query
    async fn read_once(&self, collection: &str, filter: QueryFilter) -> Result<Snapshot>;
}

/// Remote object storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes and return their public URL
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<String>;

    /// Download the bytes behind a URL
    async fn download(&self, url: &str) -> Result<Bytes>;

    /// Delete the object behind a URL
    async fn delete(&self, url: &str) -> Result<()>;
}

/// Remote callable procedures
#[async_trait]
pub trait CallableFunctions: Send + Sync {
    /// Invoke `name` with `args`
    async fn call(&self, name: &str, args: Value) -> Result<CallableResponse>;
}

/// Local key-value settings store for small scalar values
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: String) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key starting with `prefix`
    async fn remove_prefix(&self, prefix: &str) -> Result<u64>;
}

/// Outbound HTTP transport
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Asks an out-of-process surface to re-render from the exported snapshot.
///
/// Fire-and-forget: the consumer lives in another process, so there is no
/// callback, only a broadcast.
pub trait SurfaceNotifier: Send + Sync {
    fn request_reload(&self, surface: Surface);
}

/// Produces widget-sized thumbnails from cached images
pub trait ThumbnailEncoder: Send + Sync {
    fn encode(&self, source: &[u8], max_dimension: u32) -> Result<Thumbnail>;
}

/// Snapshot time helper shared by adapters
pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

// =============================================================================
// Tests
// =============================================================================
