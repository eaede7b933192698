//! pairsync - Client-side Cache and Sync Layer
//!
//! Keeps locally persisted, partner-shared, and remotely authoritative data
//! consistent for a two-party relationship app, under intermittent
//! connectivity, concurrent listeners, and strict memory/disk budgets.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (composition root)
//!   ├── cache::image     memory LRU + disk directory
//!   ├── cache::content   daily records in SQLite
//!   ├── cache::profile   TTL'd record + avatars
//!   ├── cache::realtime  remote-authoritative mirror
//!   ├── cache::presence  two-speed throttle
//!   ├── cache::widget    cross-process snapshot export
//!   └── cache::network   per-endpoint HTTP policy
//!            │
//!            ▼
//!   domain::ports  ◀── adapters (SQLite, files, reqwest, in-memory)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Implementations of the domain ports
//! - [`cache`] - Cache components and TTL/eviction primitives
//! - [`clock`] - Injectable time source
//! - [`config`] - YAML configuration
//! - [`domain`] - Ports and change events
//! - [`error`] - Error types
//! - [`orchestrator`] - Composition root, health, global wipe and sync

pub mod adapters;
pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod orchestrator;

// Re-export commonly used types
pub use cache::{
    ContentCache, ImageCache, NetworkCache, PresenceCache, ProfileCache, RealtimeCache, WidgetCache,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PairsyncConfig;
pub use error::{Error, Result};
pub use orchestrator::{CacheHealth, HealthReport, Orchestrator, OrchestratorState};
