//! Cache Change Events
//!
//! Each cache component publishes `CacheEvent`s on its own broadcast channel
//! so that UI-facing code can react to changes without polling. Events are
//! immutable records of things that have already happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Change notification emitted by a cache component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// An image was stored
    ImageStored { url_hash: String, size_bytes: u64 },

    /// Images were evicted from a tier to satisfy its byte budget
    ImagesEvicted { tier: String, count: usize },

    /// A daily content record was written
    ContentUpdated { pairing_id: String, day: String, kind: String },

    /// Daily content older than the retention window was purged
    ContentPurged { removed: u64 },

    /// The cached profile record changed or was invalidated
    ProfileChanged { present: bool },

    /// An avatar was stored or invalidated
    AvatarChanged { role: String, source_url: Option<String> },

    /// A realtime mirror finished reconciling a remote snapshot
    MirrorReconciled {
        pairing_id: String,
        inserted: usize,
        updated: usize,
        removed: usize,
    },

    /// Partner presence was refreshed
    PresenceUpdated { partner_id: String, full: bool },

    /// A widget snapshot was exported
    WidgetExported { files: usize, at: DateTime<Utc> },

    /// The component was cleared by a global wipe
    Cleared { component: String },
}

impl CacheEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::ImageStored { .. } => "ImageStored",
            CacheEvent::ImagesEvicted { .. } => "ImagesEvicted",
            CacheEvent::ContentUpdated { .. } => "ContentUpdated",
            CacheEvent::ContentPurged { .. } => "ContentPurged",
            CacheEvent::ProfileChanged { .. } => "ProfileChanged",
            CacheEvent::AvatarChanged { .. } => "AvatarChanged",
            CacheEvent::MirrorReconciled { .. } => "MirrorReconciled",
            CacheEvent::PresenceUpdated { .. } => "PresenceUpdated",
            CacheEvent::WidgetExported { .. } => "WidgetExported",
            CacheEvent::Cleared { .. } => "Cleared",
        }
    }
}

/// Per-component change feed
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<CacheEvent>,
}

impl ChangeFeed {
    /// Create a feed buffering up to `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody is listening
    pub fn publish(&self, event: CacheEvent) {
        let event_type = event.event_type();
        if self.tx.send(event).is_err() {
            trace!(event_type, "No subscribers for cache event");
        }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}
