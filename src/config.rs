//! Disk Quota Configuration
//!
//! YAML configuration for the quota engine:
//!
//! ```yaml
//! enabled: true
//! cleanup_frequency_secs: 10
//! max_concurrent_cleanups: 2
//! disk_block_size: 4096
//! policy: LRU
//! page_store_dir: /var/cache/tiles/diskquota
//! global_quota: 50 GiB
//! layers:
//!   - name: topp:states
//!     quota: 10 GiB
//!     formats: [image/png, image/jpeg]
//!     gridsets:
//!       - id: EPSG:4326
//!         tiles_wide: 2
//!         tiles_high: 1
//!         zoom_stop: 20
//!   - name: basemap
//!     formats: [image/png]
//!     gridsets:
//!       - id: EPSG:900913
//!         zoom_stop: 18
//! ```
//!
//! Layers without a `quota` share `global_quota` when one is set.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cleaner::CleanerConfig;
use crate::domain::layer::{GridSubset, StaticTileLayer};
use crate::domain::quota::{LayerQuota, Quota};
use crate::error::{Error, Result};
use crate::paging::ExpirationStrategy;

/// Deepest zoom level a configured gridset may reach
pub const MAX_ZOOM_LEVEL: u32 = 40;

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Disk quota settings and the layers they apply to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskQuotaConfig {
    /// Whether quota enforcement runs at all
    pub enabled: bool,

    /// Seconds between cleaner runs
    pub cleanup_frequency_secs: u64,

    /// Maximum layers enforced at once
    pub max_concurrent_cleanups: usize,

    /// Filesystem block size tile sizes are rounded up to
    pub disk_block_size: u64,

    /// Seconds between access clock refreshes
    pub clock_tick_secs: u64,

    /// Directory page state is persisted to
    pub page_store_dir: PathBuf,

    /// Expiration policy name (`LRU`, `LFU`, `FIFO`)
    pub policy: String,

    /// Limit shared by every layer without its own quota
    pub global_quota: Option<Quota>,

    /// Layers under quota
    pub layers: Vec<LayerConfig>,
}

impl Default for DiskQuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_frequency_secs: 10,
            max_concurrent_cleanups: 2,
            disk_block_size: 4096,
            clock_tick_secs: 60,
            page_store_dir: PathBuf::from("diskquota"),
            policy: "LRU".to_string(),
            global_quota: None,
            layers: Vec::new(),
        }
    }
}

impl DiskQuotaConfig {
    /// Read and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&text)?;
        debug!(path = %path.display(), layers = config.layers.len(), "Loaded disk quota config");
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.disk_block_size == 0 {
            return Err(Error::Config("disk_block_size must be positive".into()));
        }
        if self.cleanup_frequency_secs == 0 {
            return Err(Error::Config("cleanup_frequency_secs must be positive".into()));
        }
        if self.max_concurrent_cleanups == 0 {
            return Err(Error::Config("max_concurrent_cleanups must be positive".into()));
        }
        if self.clock_tick_secs == 0 {
            return Err(Error::Config("clock_tick_secs must be positive".into()));
        }
        self.expiration_strategy()?;
        if let Some(quota) = self.global_quota {
            if !quota.is_positive() {
                return Err(Error::Config(format!("global_quota {} must be positive", quota)));
            }
        }

        let mut names = HashSet::new();
        for layer in &self.layers {
            if !names.insert(layer.name.as_str()) {
                return Err(Error::Config(format!("duplicate layer '{}'", layer.name)));
            }
            layer.validate()?;
        }
        Ok(())
    }

    /// The configured expiration strategy
    pub fn expiration_strategy(&self) -> Result<ExpirationStrategy> {
        self.policy.parse()
    }

    pub fn cleaner_config(&self) -> CleanerConfig {
        CleanerConfig::default()
            .with_cleanup_frequency(Duration::from_secs(self.cleanup_frequency_secs))
            .with_max_concurrent_cleanups(self.max_concurrent_cleanups)
    }

    pub fn clock_tick(&self) -> Duration {
        Duration::from_secs(self.clock_tick_secs)
    }

    /// Names of the layers governed by the global quota, if one is set
    pub fn global_layers(&self) -> Vec<String> {
        if self.global_quota.is_none() {
            return Vec::new();
        }
        self.layers
            .iter()
            .filter(|l| l.quota.is_none())
            .map(|l| l.name.clone())
            .collect()
    }

    /// Configuration of one layer
    pub fn layer(&self, name: &str) -> Option<&LayerConfig> {
        self.layers.iter().find(|l| l.name == name)
    }
}

// =============================================================================
// Layers
// =============================================================================

/// One layer under quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,

    /// Disk quota; layers without one fall under the global quota, or are
    /// accounted but never truncated when there is none
    #[serde(default)]
    pub quota: Option<Quota>,

    /// MIME types the layer is cached in
    #[serde(default)]
    pub formats: Vec<String>,

    #[serde(default)]
    pub gridsets: Vec<GridSetConfig>,
}

impl LayerConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::Config(format!("layer '{}': {}", self.name, reason));

        if self.name.trim().is_empty() {
            return Err(Error::Config("layer name must not be empty".into()));
        }
        if let Some(quota) = self.quota {
            if !quota.is_positive() {
                return Err(invalid(format!("quota {} must be positive", quota)));
            }
        }
        if self.formats.is_empty() {
            return Err(invalid("no formats configured".into()));
        }
        if self.gridsets.is_empty() {
            return Err(invalid("no gridsets configured".into()));
        }

        let mut ids = HashSet::new();
        for gridset in &self.gridsets {
            if !ids.insert(gridset.id.as_str()) {
                return Err(invalid(format!("duplicate gridset '{}'", gridset.id)));
            }
            gridset.validate().map_err(invalid)?;
        }
        Ok(())
    }

    /// In-process tile layer for this configuration
    pub fn build_layer(&self) -> StaticTileLayer {
        StaticTileLayer::new(
            self.name.clone(),
            self.gridsets.iter().map(GridSetConfig::build).collect(),
            self.formats.clone(),
        )
    }

    /// Fresh quota record with no usage
    pub fn build_quota(&self) -> Arc<LayerQuota> {
        Arc::new(LayerQuota::new(self.name.clone(), self.quota))
    }
}

/// A power-of-two gridset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSetConfig {
    pub id: String,

    /// Tile columns at zoom level 0
    #[serde(default = "default_tiles")]
    pub tiles_wide: i64,

    /// Tile rows at zoom level 0
    #[serde(default = "default_tiles")]
    pub tiles_high: i64,

    #[serde(default)]
    pub zoom_start: u32,

    pub zoom_stop: u32,
}

fn default_tiles() -> i64 {
    1
}

impl GridSetConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("gridset id must not be empty".into());
        }
        if self.tiles_wide <= 0 || self.tiles_high <= 0 {
            return Err(format!("gridset '{}': tile counts must be positive", self.id));
        }
        if self.zoom_stop < self.zoom_start {
            return Err(format!(
                "gridset '{}': zoom_stop {} is below zoom_start {}",
                self.id, self.zoom_stop, self.zoom_start
            ));
        }
        if self.zoom_stop > MAX_ZOOM_LEVEL {
            return Err(format!(
                "gridset '{}': zoom_stop {} exceeds {}",
                self.id, self.zoom_stop, MAX_ZOOM_LEVEL
            ));
        }
        for tiles in [self.tiles_wide, self.tiles_high] {
            if GridSubset::doubled_extent(tiles, self.zoom_stop).is_none() {
                return Err(format!(
                    "gridset '{}': {} tiles at zoom 0 overflow at zoom {}",
                    self.id, tiles, self.zoom_stop
                ));
            }
        }
        Ok(())
    }

    pub fn build(&self) -> GridSubset {
        GridSubset::doubling(
            self.id.clone(),
            self.tiles_wide,
            self.tiles_high,
            self.zoom_start,
            self.zoom_stop,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
