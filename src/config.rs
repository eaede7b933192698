//! Configuration
//!
//! One YAML document with a section per cache component. Every field has a
//! default, so an empty file (or no file) is a valid configuration. Relative
//! directories are resolved against `data_dir`.
//!
//! ```yaml
//! data_dir: /var/lib/pairsync
//! image:
//!   memory_capacity_bytes: 52428800
//!   ttl: 604800
//! presence:
//!   signal_ttl: 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{
    ContentCacheConfig, ImageCacheConfig, NetworkCacheConfig, PresenceConfig, ProfileCacheConfig,
    RealtimeConfig, WidgetConfig,
};
use crate::cache::ttl::secs;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PairsyncConfig {
    /// Root for every locally persisted file
    pub data_dir: PathBuf,
    /// Structured store file name, relative to `data_dir`
    pub database_file: PathBuf,
    /// Settings store file name, relative to `data_dir`
    pub settings_file: PathBuf,
    /// Period of the image disk cleanup task
    #[serde(with = "secs")]
    pub image_cleanup_interval: Duration,
    pub image: ImageCacheConfig,
    pub content: ContentCacheConfig,
    pub profile: ProfileCacheConfig,
    pub realtime: RealtimeConfig,
    pub presence: PresenceConfig,
    pub widget: WidgetConfig,
    pub network: NetworkCacheConfig,
}

impl Default for PairsyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("pairsync-data"),
            database_file: PathBuf::from("pairsync.db"),
            settings_file: PathBuf::from("settings.json"),
            image_cleanup_interval: Duration::from_secs(6 * 3600),
            image: ImageCacheConfig::default(),
            content: ContentCacheConfig::default(),
            profile: ProfileCacheConfig::default(),
            realtime: RealtimeConfig::default(),
            presence: PresenceConfig::default(),
            widget: WidgetConfig::default(),
            network: NetworkCacheConfig::default(),
        }
    }
}

impl PairsyncConfig {
    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: PairsyncConfig =
            serde_yaml::from_str(content).map_err(|e| Error::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Load from `path` if given, otherwise use the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.memory_capacity_bytes == 0 || self.image.disk_capacity_bytes == 0 {
            return Err(Error::Config("image capacities must be non-zero".to_string()));
        }
        if !(0.0..=1.0).contains(&self.image.disk_low_watermark) {
            return Err(Error::Config(format!(
                "image.disk_low_watermark must be within 0.0..=1.0, got {}",
                self.image.disk_low_watermark
            )));
        }
        if self.presence.signal_ttl > self.presence.data_ttl {
            return Err(Error::Config(
                "presence.signal_ttl must not exceed presence.data_ttl".to_string(),
            ));
        }
        if self.presence.stale_ceiling < self.presence.data_ttl {
            return Err(Error::Config(
                "presence.stale_ceiling must be at least presence.data_ttl".to_string(),
            ));
        }
        let periods = [
            ("content.sweep_interval", self.content.sweep_interval),
            ("widget.purge_interval", self.widget.purge_interval),
            ("image_cleanup_interval", self.image_cleanup_interval),
            ("image.ttl", self.image.ttl),
            ("profile.ttl", self.profile.ttl),
            ("network.request_timeout", self.network.request_timeout),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, period)| period.is_zero()) {
            return Err(Error::Config(format!("{} must be non-zero", name)));
        }
        if self.content.retention_days == 0 {
            return Err(Error::Config("content.retention_days must be at least 1".to_string()));
        }
        for rule in &self.network.rules {
            if !rule.prefix.starts_with('/') {
                return Err(Error::Config(format!(
                    "network rule prefix '{}' must start with '/'",
                    rule.prefix
                )));
            }
        }
        Ok(())
    }

    /// Copy with every relative path joined onto `data_dir`
    pub fn resolved(&self) -> Self {
        let mut config = self.clone();
        config.database_file = self.resolve(&self.database_file);
        config.settings_file = self.resolve(&self.settings_file);
        config.image.directory = self.resolve(&self.image.directory);
        config.profile.avatar_directory = self.resolve(&self.profile.avatar_directory);
        config.widget.directory = self.resolve(&self.widget.directory);
        config
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    /// Replace `data_dir`
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }
}
