//! Cache Components
//!
//! Each component owns its storage and is constructed once by the
//! orchestrator:
//!
//! - **ttl** - pure expiry, budget, and victim selection primitives
//! - **image** - two-level (memory + disk) blob cache
//! - **content** - daily content records in the structured store
//! - **profile** - profile record and avatars
//! - **realtime** - mirror of a partner-shared remote collection
//! - **presence** - two-speed throttle around the presence call
//! - **widget** - cross-process snapshot export
//! - **network** - per-endpoint HTTP response cache
//! - **metrics** - per-component counters

pub mod content;
pub mod image;
pub mod metrics;
pub mod network;
pub mod presence;
pub mod profile;
pub mod realtime;
pub mod ttl;
pub mod widget;

pub use content::{ContentCache, ContentCacheConfig, ContentKind, DailyContent};
pub use image::{ImageBlob, ImageCache, ImageCacheConfig, ImageCacheStats};
pub use metrics::{CacheCounters, ComponentMetrics, MissReason};
pub use network::{Connectivity, EndpointPolicy, NetworkCache, NetworkCacheConfig};
pub use presence::{PresenceCache, PresenceConfig, PresenceData, PresenceReading};
pub use profile::{AvatarRole, CachedAvatar, ProfileCache, ProfileCacheConfig, ProfileRecord};
pub use realtime::{RealtimeCache, RealtimeConfig, RecordState, SharedRecord, ViewItem};
pub use ttl::{CacheRecord, EvictionCandidate, Freshness, SizeBudget, TtlPolicy};
pub use widget::{WidgetCache, WidgetConfig, WidgetImage, WidgetSnapshot};

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Run `job` every `period` until `token` is cancelled.
///
/// The first run happens one period after spawning. A failing run is logged
/// and does not stop the loop.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        info!(task = name, period_secs = period.as_secs(), "Starting periodic task");
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(task = name, "Periodic task shutting down");
                    break;
                }
                _ = tick.tick() => {
                    match job().await {
                        Ok(()) => debug!(task = name, "Periodic task run complete"),
                        Err(e) => warn!(task = name, error = %e, "Periodic task run failed"),
                    }
                }
            }
        }
    })
}
