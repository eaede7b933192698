//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//! - **Events** (`events.rs`) - Change events published by cache components

pub mod events;
pub mod ports;

pub use events::{CacheEvent, ChangeFeed};
pub use ports::{
    BlobStore, CallableFunctions, CallableResponse, DocumentStore, HttpRequest, HttpResponse,
    HttpTransport, QueryFilter, RemoteDocument, SettingsStore, Snapshot, Surface,
    SurfaceNotifier, Thumbnail, ThumbnailEncoder,
};
