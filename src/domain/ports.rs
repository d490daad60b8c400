//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the abstractions the quota engine depends on.
//! Infrastructure adapters implement these traits to provide concrete
//! implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  TileLayer │ PageStore │ UsageStore │ TileTruncator  │    │
//! │  │  EventPublisher                                      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  FilePageStore │ InMemoryPageStore │ LoggingPublisher│    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::events::QuotaEvent;
use super::layer::{GridSubset, LevelCoverage, TileRequest};
use super::quota::Quota;
use crate::error::Result;

// =============================================================================
// Tile Layer Port
// =============================================================================

/// Receives a notification for every tile request served by a layer.
pub trait TileLayerListener: Send + Sync {
    fn tile_requested(&self, layer: &str, request: &TileRequest);
}

/// Port for the tile layers whose cache usage is being tracked.
pub trait TileLayer: Send + Sync {
    /// Layer name
    fn name(&self) -> &str;

    /// Gridsets the layer is served under
    fn grid_subsets(&self) -> Vec<GridSubset>;

    /// Storage formats the layer caches tiles in (e.g. `image/png`)
    fn mime_formats(&self) -> Vec<String>;

    /// Register a request listener
    fn add_listener(&self, listener: Arc<dyn TileLayerListener>);

    /// Unregister a listener, returning whether it was registered
    fn remove_listener(&self, listener: &Arc<dyn TileLayerListener>) -> bool;
}

// =============================================================================
// Page Store Port
// =============================================================================

/// Persisted statistics of one tile page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRecord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub hits: u64,
    pub tiles_in_page: i64,
    pub last_access_minutes: u32,
}

/// Port for persisting page statistics between restarts.
///
/// `load_pages` must fail with an error for which
/// [`Error::is_not_found`](crate::error::Error::is_not_found) is true when no
/// snapshot exists yet.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Load the last snapshot for a (layer, gridset) pair
    async fn load_pages(&self, layer: &str, gridset_id: &str) -> Result<Vec<PageRecord>>;

    /// Replace the snapshot for a (layer, gridset) pair
    async fn save_pages(&self, layer: &str, gridset_id: &str, pages: &[PageRecord]) -> Result<()>;
}

// =============================================================================
// Usage Store Port
// =============================================================================

/// Port for persisting the used quota of every layer between restarts.
///
/// `load_usage` fails with an error for which `is_not_found` is true when
/// nothing was saved yet.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Last saved usage, keyed by layer name
    async fn load_usage(&self) -> Result<BTreeMap<String, Quota>>;

    /// Replace the saved usage of all layers
    async fn save_usage(&self, usage: &BTreeMap<String, Quota>) -> Result<()>;
}

// =============================================================================
// Truncation Port
// =============================================================================

/// Per-level tile ranges indexed by zoom level.
///
/// Truncation works one zoom level at a time, so pages produce a coverage
/// with a single populated level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridCoverage {
    levels: Vec<Option<LevelCoverage>>,
}

impl GridCoverage {
    /// Coverage with only `coverage.zoom` populated
    pub fn single_level(coverage: LevelCoverage) -> Self {
        let mut levels = vec![None; coverage.zoom as usize + 1];
        levels[coverage.zoom as usize] = Some(coverage);
        Self { levels }
    }

    /// Range at `zoom`, if populated
    pub fn level(&self, zoom: u32) -> Option<&LevelCoverage> {
        self.levels.get(zoom as usize).and_then(Option::as_ref)
    }

    /// All populated levels, lowest zoom first
    pub fn populated(&self) -> impl Iterator<Item = &LevelCoverage> {
        self.levels.iter().flatten()
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

/// A request to delete every stored tile in a range for one format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRange {
    pub layer: String,
    pub gridset_id: String,
    pub zoom_start: u32,
    pub zoom_stop: u32,
    pub coverage: GridCoverage,
    pub mime_format: String,
}

impl TileRange {
    /// Range covering a single zoom level
    pub fn for_level(
        layer: impl Into<String>,
        gridset_id: impl Into<String>,
        coverage: GridCoverage,
        zoom: u32,
        mime_format: impl Into<String>,
    ) -> Self {
        Self {
            layer: layer.into(),
            gridset_id: gridset_id.into(),
            zoom_start: zoom,
            zoom_stop: zoom,
            coverage,
            mime_format: mime_format.into(),
        }
    }

    /// True when `(x, y, z)` lies inside this range
    pub fn contains(&self, x: i64, y: i64, z: u32) -> bool {
        z >= self.zoom_start
            && z <= self.zoom_stop
            && self.coverage.level(z).is_some_and(|c| c.contains(x, y))
    }
}

impl fmt::Display for TileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{} z{}", self.layer, self.gridset_id, self.mime_format, self.zoom_start)?;
        for level in self.coverage.populated() {
            write!(f, " {}", level)?;
        }
        Ok(())
    }
}

/// Port for the component that deletes stored tiles.
///
/// Deleting tiles is expected to lower the layer's used quota as a side
/// effect (through the accounting subsystem). The call completes only once
/// the tiles are gone.
#[async_trait]
pub trait TileTruncator: Send + Sync {
    async fn truncate(&self, range: &TileRange) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: QuotaEvent) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_level_coverage() {
        let cov = GridCoverage::single_level(LevelCoverage::new(4, 8, 7, 11, 3));
        assert_eq!(cov.num_levels(), 4);
        assert!(cov.level(0).is_none());
        assert!(cov.level(2).is_none());
        assert_eq!(cov.level(3).unwrap().min_x, 4);
        assert!(cov.level(4).is_none());
        assert_eq!(cov.populated().count(), 1);
    }

    #[test]
    fn test_tile_range_contains() {
        let cov = GridCoverage::single_level(LevelCoverage::new(4, 8, 7, 11, 3));
        let range = TileRange::for_level("roads", "EPSG:4326", cov, 3, "image/png");

        assert!(range.contains(4, 8, 3));
        assert!(range.contains(7, 11, 3));
        assert!(!range.contains(8, 8, 3));
        assert!(!range.contains(4, 8, 2));
        assert_eq!(
            range.to_string(),
            "roads/EPSG:4326/image/png z3 [4, 8, 7, 11, z3]"
        );
    }
}
