//! Cache Orchestrator
//!
//! Composition root for the cache layer. It builds every component once,
//! and owns the cross-cutting operations:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                            │
//! │   initialize ──▶ probe ──▶ preload ──▶ schedule maintenance      │
//! │   wipe_all   ──▶ not ready ──▶ clear all (concurrently) ──▶ ready│
//! │   sync_all   ──▶ prime content ──▶ export widget snapshot        │
//! ├──────────┬─────────┬─────────┬──────────┬──────────┬──────┬──────┤
//! │  image   │ content │ profile │ realtime │ presence │widget│ net  │
//! └──────────┴─────────┴─────────┴──────────┴──────────┴──────┴──────┘
//! ```
//!
//! A failing probe or preload step is logged and recorded in the health
//! report; it never stops the other steps.

pub mod health;
pub mod scheduler;

pub use health::{CacheHealth, HealthReport, ProbeResult, Readiness};
pub use scheduler::Scheduler;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{
    FileSettingsStore, InMemoryBlobStore, InMemoryCallables, InMemoryDocumentStore, LoggingNotifier,
    ReqwestTransport, ResizingEncoder, SqliteStore,
};
use crate::cache::metrics::render_prometheus;
use crate::cache::{
    spawn_periodic, AvatarRole, ComponentMetrics, Connectivity, ContentCache, ContentKind, ImageCache,
    NetworkCache, PresenceCache, ProfileCache, RealtimeCache, WidgetCache, WidgetImage,
};
use crate::clock::{self, Clock};
use crate::config::PairsyncConfig;
use crate::domain::ports::{
    BlobStore, CallableFunctions, DocumentStore, HttpTransport, SettingsStore, SurfaceNotifier,
    ThumbnailEncoder,
};
use crate::error::{Error, Result};

/// Lifecycle of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Outcome of a global wipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WipeReport {
    /// Components that cleared without error
    pub cleared: Vec<String>,
    /// `component: error` for each failure
    pub failures: Vec<String>,
    /// Health after the post-wipe probe and preload
    pub health: CacheHealth,
}

/// Outcome of `sync_all`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Daily content records fetched because they were missing
    pub content_primed: usize,
    /// Thumbnails written to the widget snapshot
    pub images_exported: usize,
    /// Steps that failed without stopping the sync
    pub failures: Vec<String>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Orchestrator`]. Collaborators not supplied get local-only
/// defaults: in-memory remote ports, a settings file under the data
/// directory, a logging notifier, and the resizing thumbnail encoder.
#[must_use]
pub struct OrchestratorBuilder {
    config: PairsyncConfig,
    clock: Option<Arc<dyn Clock>>,
    documents: Option<Arc<dyn DocumentStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    callables: Option<Arc<dyn CallableFunctions>>,
    settings: Option<Arc<dyn SettingsStore>>,
    transport: Option<Arc<dyn HttpTransport>>,
    notifier: Option<Arc<dyn SurfaceNotifier>>,
    encoder: Option<Arc<dyn ThumbnailEncoder>>,
    connectivity: Option<Arc<Connectivity>>,
    store: Option<Arc<SqliteStore>>,
}

impl OrchestratorBuilder {
    fn new(config: PairsyncConfig) -> Self {
        Self {
            config,
            clock: None,
            documents: None,
            blobs: None,
            callables: None,
            settings: None,
            transport: None,
            notifier: None,
            encoder: None,
            connectivity: None,
            store: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn callables(mut self, callables: Arc<dyn CallableFunctions>) -> Self {
        self.callables = Some(callables);
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn SurfaceNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn ThumbnailEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn connectivity(mut self, connectivity: Arc<Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Use an existing structured store instead of opening the database file
    pub fn store(mut self, store: Arc<SqliteStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let config = self.config.resolved();
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let clock = self.clock.unwrap_or_else(clock::system);
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteStore::open(&config.database_file)?),
        };
        let settings: Arc<dyn SettingsStore> = match self.settings {
            Some(settings) => settings,
            None => Arc::new(FileSettingsStore::open(&config.settings_file).await?),
        };
        let documents = self
            .documents
            .unwrap_or_else(|| Arc::new(InMemoryDocumentStore::new()));
        let blobs = self.blobs.unwrap_or_else(|| Arc::new(InMemoryBlobStore::new()));
        let callables = self
            .callables
            .unwrap_or_else(|| Arc::new(InMemoryCallables::new()));
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(config.network.request_timeout)?),
        };
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LoggingNotifier::new()));
        let encoder = self.encoder.unwrap_or_else(|| Arc::new(ResizingEncoder));
        let connectivity = self.connectivity.unwrap_or_else(|| Connectivity::new(true));

        let image = Arc::new(ImageCache::new(&config.image, Arc::clone(&clock))?);
        let content = Arc::new(ContentCache::new(
            Arc::clone(&store),
            Arc::clone(&documents),
            Arc::clone(&clock),
            config.content.clone(),
        ));
        let profile = Arc::new(ProfileCache::new(
            Arc::clone(&settings),
            blobs,
            Arc::clone(&clock),
            config.profile.clone(),
        ));
        let realtime = Arc::new(RealtimeCache::new(
            Arc::clone(&store),
            documents,
            Arc::clone(&clock),
            config.realtime.clone(),
        ));
        let presence = Arc::new(PresenceCache::new(
            Arc::clone(&settings),
            callables,
            Arc::clone(&clock),
            config.presence.clone(),
        ));
        let widget = Arc::new(WidgetCache::new(
            encoder,
            notifier,
            Arc::clone(&clock),
            config.widget.clone(),
        )?);
        let network = Arc::new(NetworkCache::new(
            transport,
            connectivity,
            Arc::clone(&clock),
            config.network.clone(),
        ));

        info!(data_dir = %config.data_dir.display(), "Cache layer constructed");
        Ok(Orchestrator {
            config,
            clock,
            store,
            settings,
            image,
            content,
            profile,
            realtime,
            presence,
            widget,
            network,
            state: RwLock::new(OrchestratorState::Uninitialized),
            readiness: Readiness::new(),
            scheduler: Scheduler::new(),
            startup_failures: Mutex::new(Vec::new()),
            wipe_lock: tokio::sync::Mutex::new(()),
        })
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Owner of every cache component
pub struct Orchestrator {
    config: PairsyncConfig,
    clock: Arc<dyn Clock>,
    store: Arc<SqliteStore>,
    settings: Arc<dyn SettingsStore>,
    image: Arc<ImageCache>,
    content: Arc<ContentCache>,
    profile: Arc<ProfileCache>,
    realtime: Arc<RealtimeCache>,
    presence: Arc<PresenceCache>,
    widget: Arc<WidgetCache>,
    network: Arc<NetworkCache>,
    state: RwLock<OrchestratorState>,
    readiness: Readiness,
    scheduler: Scheduler,
    /// Failures from the last preload
    startup_failures: Mutex<Vec<String>>,
    wipe_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn builder(config: PairsyncConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &PairsyncConfig {
        &self.config
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn image(&self) -> &Arc<ImageCache> {
        &self.image
    }

    pub fn content(&self) -> &Arc<ContentCache> {
        &self.content
    }

    pub fn profile(&self) -> &Arc<ProfileCache> {
        &self.profile
    }

    pub fn realtime(&self) -> &Arc<RealtimeCache> {
        &self.realtime
    }

    pub fn presence(&self) -> &Arc<PresenceCache> {
        &self.presence
    }

    pub fn widget(&self) -> &Arc<WidgetCache> {
        &self.widget
    }

    pub fn network(&self) -> &Arc<NetworkCache> {
        &self.network
    }

    /// Maintenance tasks currently scheduled
    pub fn scheduled_tasks(&self) -> Vec<&'static str> {
        self.scheduler.task_names()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Probe, preload, then schedule maintenance. Calling it again once ready
    /// is a no-op.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<HealthReport> {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            if previous == OrchestratorState::Uninitialized {
                *state = OrchestratorState::Initializing;
            }
            previous
        };
        match previous {
            OrchestratorState::Ready => return Ok(self.health().await),
            OrchestratorState::Initializing => {
                return Err(Error::InvalidState("initialization already in progress".to_string()));
            }
            OrchestratorState::Uninitialized => {}
        }
        info!("Initializing cache layer");

        let probe = self.health().await;
        if !probe.status.is_healthy() {
            warn!(status = %probe.status, "Startup probe not healthy, continuing");
        }
        self.preload().await;
        self.schedule_maintenance();

        *self.state.write() = OrchestratorState::Ready;
        self.readiness.set_ready(true);

        let report = self.health().await;
        info!(status = %report.status, "Cache layer ready");
        Ok(report)
    }

    async fn preload(&self) {
        let mut failures = Vec::new();

        match self.image.preload().await {
            Ok(indexed) => debug!(indexed, "Image index preloaded"),
            Err(e) => failures.push(format!("image: {}", e)),
        }
        match self.widget.preload().await {
            Ok(files) => debug!(files, "Widget index preloaded"),
            Err(e) => failures.push(format!("widget: {}", e)),
        }

        // Presence and the realtime mirror are keyed by the cached profile
        if let Some(profile) = self.profile.get().await {
            if let Some(partner_id) = profile.partner_id.as_deref() {
                if let Err(e) = self.presence.preload(partner_id).await {
                    failures.push(format!("presence: {}", e));
                }
            }
            if let Some(pairing_id) = profile.pairing_id.as_deref() {
                if let Err(e) = self.realtime.preload(pairing_id).await {
                    failures.push(format!("realtime: {}", e));
                }
            }
        }

        for failure in &failures {
            warn!(failure = %failure, "Preload step failed");
        }
        *self.startup_failures.lock() = failures;
    }

    fn schedule_maintenance(&self) {
        if !self.scheduler.is_empty() {
            return;
        }
        let token = self.scheduler.token();

        self.scheduler.register(
            "content-sweeper",
            self.content
                .spawn_sweeper(self.content.sweep_interval(), token.clone()),
        );
        self.scheduler
            .register("widget-purger", self.widget.spawn_purger(token.clone()));

        let image = Arc::clone(&self.image);
        let cleanup = spawn_periodic(
            "image-cleanup",
            self.config.image_cleanup_interval,
            token,
            move || {
                let image = Arc::clone(&image);
                async move { image.cleanup_disk().await.map(|_| ()) }
            },
        );
        self.scheduler.register("image-cleanup", cleanup);
        info!(tasks = ?self.scheduler.task_names(), "Maintenance scheduled");
    }

    /// Stop maintenance and listeners, and flush pending disk writes
    pub async fn shutdown(&self) {
        info!("Shutting down cache layer");
        self.readiness.set_ready(false);
        self.scheduler.shutdown().await;
        self.realtime.stop_all().await;
        self.image.flush().await;
        *self.state.write() = OrchestratorState::Uninitialized;
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Run every probe and aggregate
    pub async fn health(&self) -> HealthReport {
        let mut probes = Vec::new();

        let started = Instant::now();
        probes.push(
            match self.store.ping().await {
                Ok(()) => ProbeResult::healthy("structured_store"),
                Err(e) => ProbeResult::error("structured_store", e.to_string()),
            }
            .with_duration(started.elapsed()),
        );

        let started = Instant::now();
        probes.push(
            match self.settings.get("health.probe").await {
                Ok(_) => ProbeResult::healthy("settings_store"),
                Err(e) => ProbeResult::error("settings_store", e.to_string()),
            }
            .with_duration(started.elapsed()),
        );

        let started = Instant::now();
        probes.push(
            ProbeResult::from_check(
                "image_directory",
                directory_writable(&self.config.image.directory).await,
                "image directory is not writable",
            )
            .with_duration(started.elapsed()),
        );

        let started = Instant::now();
        probes.push(
            ProbeResult::from_check(
                "widget_directory",
                self.widget.probe().await,
                "widget directory is not writable",
            )
            .with_duration(started.elapsed()),
        );

        let failures = self.startup_failures.lock().clone();
        probes.push(ProbeResult::from_check("preload", failures.is_empty(), failures.join("; ")));

        for (component, metrics) in self.metrics().await {
            probes.push(ProbeResult::from_check(
                component,
                !metrics.has_failures(),
                format!(
                    "{} storage failures, {} remote failures",
                    metrics.storage_failures, metrics.remote_failures
                ),
            ));
        }

        HealthReport::new(probes, self.readiness.is_ready(), self.readiness.uptime())
    }

    // =========================================================================
    // Global operations
    // =========================================================================

    /// Clear every component, then probe and preload again. Readiness is off
    /// for the duration. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn wipe_all(&self) -> WipeReport {
        let _guard = self.wipe_lock.lock().await;
        let was_ready = self.readiness.is_ready();
        self.readiness.set_ready(false);
        info!("Global wipe started");

        let (image, content, profile, realtime, presence, widget) = tokio::join!(
            self.image.clear(),
            self.content.clear(),
            self.profile.clear(),
            self.realtime.clear(),
            self.presence.clear(),
            self.widget.clear(),
        );
        self.network.clear();

        // Failures recorded before the wipe describe data that no longer exists
        self.reset_counters();

        let results = [
            ("image", image),
            ("content", content.map(|_| ())),
            ("profile", profile),
            ("realtime", realtime),
            ("presence", presence),
            ("widget", widget),
            ("network", Ok(())),
        ];
        let mut cleared = Vec::new();
        let mut failures = Vec::new();
        for (component, result) in results {
            match result {
                Ok(()) => cleared.push(component.to_string()),
                Err(e) => {
                    warn!(component, error = %e, "Component failed to clear");
                    failures.push(format!("{}: {}", component, e));
                }
            }
        }

        self.preload().await;
        let health = self.health().await.status;
        if was_ready || self.state() == OrchestratorState::Ready {
            self.readiness.set_ready(true);
        }
        info!(cleared = cleared.len(), failed = failures.len(), "Global wipe finished");

        WipeReport {
            cleared,
            failures,
            health,
        }
    }

    fn reset_counters(&self) {
        for counters in [
            self.image.counters(),
            self.content.counters(),
            self.profile.counters(),
            self.realtime.counters(),
            self.presence.counters(),
            self.widget.counters(),
            self.network.counters(),
        ] {
            counters.reset();
        }
    }

    /// Push cached profile, avatars and presence to the widget snapshot,
    /// priming today's content first when it is missing.
    #[instrument(skip(self))]
    pub async fn sync_all(&self, user_id: &str, pairing_id: &str) -> Result<SyncReport> {
        let today = self.clock.now().date_naive();
        let mut failures = Vec::new();
        let mut content_primed = 0;

        let mut daily = BTreeMap::new();
        for kind in ContentKind::ALL {
            let mut record = self.content.get_for_day(kind, pairing_id, today).await;
            if record.is_none() {
                match self.content.refresh_from_remote(kind, pairing_id, today).await {
                    Ok(Some(fetched)) => {
                        content_primed += 1;
                        record = Some(fetched);
                    }
                    Ok(None) => debug!(%kind, "No remote content for today"),
                    Err(e) => failures.push(format!("content {}: {}", kind, e)),
                }
            }
            daily.insert(kind.as_str(), record.map(|r| r.payload));
        }

        let profile = self.profile.get().await;
        let mut images = Vec::new();
        for role in AvatarRole::ALL {
            if let Some(avatar) = self.profile.get_avatar(role).await {
                images.push(WidgetImage::new(format!("{}_avatar", role), avatar.bytes));
            }
        }
        let presence = profile
            .as_ref()
            .and_then(|p| p.partner_id.as_deref())
            .and_then(|partner_id| self.presence.peek(partner_id));

        let fields = json!({
            "user_id": user_id,
            "pairing_id": pairing_id,
            "display_name": profile.as_ref().map(|p| p.display_name.clone()),
            "partner_presence": presence.map(|p| json!({
                "data": p.data,
                "signal": p.signal,
                "updated_at": p.signal_cached_at,
            })),
            "daily": daily,
            "synced_at": self.clock.now(),
        });

        let snapshot = self.widget.export(fields, images).await?;
        for failure in &failures {
            warn!(failure = %failure, "Sync step failed");
        }
        Ok(SyncReport {
            content_primed,
            images_exported: snapshot.images.len(),
            failures,
        })
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Metrics of every component, by name
    pub async fn metrics(&self) -> BTreeMap<String, ComponentMetrics> {
        let mut metrics = BTreeMap::new();
        metrics.insert("image".to_string(), self.image.metrics());
        metrics.insert("content".to_string(), self.content.metrics().await);
        metrics.insert("profile".to_string(), self.profile.metrics().await);
        metrics.insert("realtime".to_string(), self.realtime.metrics().await);
        metrics.insert("presence".to_string(), self.presence.metrics());
        metrics.insert("widget".to_string(), self.widget.metrics());
        metrics.insert("network".to_string(), self.network.metrics());
        metrics
    }

    /// Prometheus text exposition of [`Orchestrator::metrics`]
    pub async fn render_prometheus(&self) -> Result<String> {
        render_prometheus(&self.metrics().await)
    }
}

async fn directory_writable(dir: &Path) -> bool {
    let probe = dir.join(".probe");
    let ok = tokio::fs::write(&probe, b"ok").await.is_ok();
    let _ = tokio::fs::remove_file(&probe).await;
    ok
}

// =============================================================================
// Tests
// =============================================================================
