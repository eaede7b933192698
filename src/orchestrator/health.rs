//! Health Checks
//!
//! Per-component probes rolled up into one report, plus the readiness flag
//! that a global wipe flips off while it runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Health of one probe or of the whole cache layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheHealth {
    /// Not probed yet
    Unknown,
    /// Probe passed
    Healthy,
    /// Probe returned false, or failures were recorded
    Warning,
    /// Probe itself failed
    Error,
}

impl CacheHealth {
    fn severity(&self) -> u8 {
        match self {
            CacheHealth::Healthy => 0,
            CacheHealth::Unknown => 1,
            CacheHealth::Warning => 2,
            CacheHealth::Error => 3,
        }
    }

    /// Healthy or warning
    pub fn is_operational(&self) -> bool {
        matches!(self, CacheHealth::Healthy | CacheHealth::Warning)
    }

    pub fn is_healthy(&self) -> bool {
        *self == CacheHealth::Healthy
    }
}

impl std::fmt::Display for CacheHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheHealth::Unknown => write!(f, "Unknown"),
            CacheHealth::Healthy => write!(f, "Healthy"),
            CacheHealth::Warning => write!(f, "Warning"),
            CacheHealth::Error => write!(f, "Error"),
        }
    }
}

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Probe name
    pub name: String,
    pub status: CacheHealth,
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl ProbeResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CacheHealth::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    pub fn warning(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CacheHealth::Warning,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CacheHealth::Error,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// From a boolean probe: false is a warning
    pub fn from_check(name: impl Into<String>, passed: bool, message: impl Into<String>) -> Self {
        if passed {
            Self::healthy(name)
        } else {
            Self::warning(name, message)
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Aggregated health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Error if any probe errors, Warning if any probe warns, else Healthy
    pub status: CacheHealth,
    pub ready: bool,
    pub probes: Vec<ProbeResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthReport {
    pub fn new(probes: Vec<ProbeResult>, ready: bool, uptime: Duration) -> Self {
        let status = probes
            .iter()
            .map(|p| p.status)
            .max_by_key(CacheHealth::severity)
            .unwrap_or(CacheHealth::Unknown);

        Self {
            status,
            ready,
            probes,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }

    /// Probe by name
    pub fn probe(&self, name: &str) -> Option<&ProbeResult> {
        self.probes.iter().find(|p| p.name == name)
    }
}

/// Readiness and uptime
pub struct Readiness {
    start_time: Instant,
    ready: AtomicBool,
}

impl Readiness {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
