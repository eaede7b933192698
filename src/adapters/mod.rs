//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  DocumentStore │ BlobStore │ SettingsStore │ HttpTransport │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemory* │ FileSettingsStore │ SqliteStore               │ │
//! │  │ ReqwestTransport │ LoggingNotifier │ ResizingEncoder      │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pairsync::adapters::{FileSettingsStore, SqliteStore};
//! use pairsync::domain::ports::SettingsStore;
//!
//! let settings = FileSettingsStore::open(data_dir.join("settings.json")).await?;
//! settings.put("presence.p1", json).await?;
//!
//! let store = SqliteStore::open(data_dir.join("cache.db"))?;
//! ```

mod http;
mod memory;
mod notifier;
mod settings;
pub mod sqlite;
pub mod thumbnail;

pub use http::ReqwestTransport;
pub use memory::{InMemoryBlobStore, InMemoryCallables, InMemoryDocumentStore, InMemorySettingsStore};
pub use notifier::{CompositeNotifier, LoggingNotifier, RecordingNotifier};
pub use settings::FileSettingsStore;
pub use sqlite::SqliteStore;
pub use thumbnail::{ImageInfo, ResizingEncoder};
