//! Tile Layer Model
//!
//! Grid coverage descriptions and an in-process [`TileLayer`] implementation.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::ports::{TileLayer, TileLayerListener};

/// Inclusive tile bounds of one zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelCoverage {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
    pub zoom: u32,
}

impl LevelCoverage {
    pub fn new(min_x: i64, min_y: i64, max_x: i64, max_y: i64, zoom: u32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
            zoom,
        }
    }

    /// Number of tile columns
    pub fn tiles_wide(&self) -> i64 {
        1 + self.max_x - self.min_x
    }

    /// Number of tile rows
    pub fn tiles_high(&self) -> i64 {
        1 + self.max_y - self.min_y
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// `[min_x, min_y, max_x, max_y, zoom]`
    pub fn as_array(&self) -> [i64; 5] {
        [
            self.min_x,
            self.min_y,
            self.max_x,
            self.max_y,
            self.zoom as i64,
        ]
    }
}

impl fmt::Display for LevelCoverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}, z{}]",
            self.min_x, self.min_y, self.max_x, self.max_y, self.zoom
        )
    }
}

/// A named tiling scheme a layer is served under, with its coverage per level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridSubset {
    id: String,
    coverages: Vec<LevelCoverage>,
}

impl GridSubset {
    pub fn new(id: impl Into<String>, coverages: Vec<LevelCoverage>) -> Self {
        Self {
            id: id.into(),
            coverages,
        }
    }

    /// Full-extent pyramid whose tile count doubles on both axes per level.
    ///
    /// `tiles_wide` x `tiles_high` is the grid at zoom level 0, so EPSG:4326
    /// is `(2, 1)` and EPSG:3857 is `(1, 1)`. Extents that do not fit an
    /// `i64` saturate; callers validate with [`GridSubset::doubled_extent`].
    pub fn doubling(
        id: impl Into<String>,
        tiles_wide: i64,
        tiles_high: i64,
        zoom_start: u32,
        zoom_stop: u32,
    ) -> Self {
        let coverages = (zoom_start..=zoom_stop)
            .map(|zoom| {
                let wide = Self::doubled_extent(tiles_wide, zoom).unwrap_or(i64::MAX);
                let high = Self::doubled_extent(tiles_high, zoom).unwrap_or(i64::MAX);
                LevelCoverage::new(0, 0, wide - 1, high - 1, zoom)
            })
            .collect();
        Self::new(id, coverages)
    }

    /// `tiles * 2^zoom`, or `None` on overflow
    pub fn doubled_extent(tiles: i64, zoom: u32) -> Option<i64> {
        2i64.checked_pow(zoom).and_then(|scale| tiles.checked_mul(scale))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn coverages(&self) -> &[LevelCoverage] {
        &self.coverages
    }

    pub fn num_levels(&self) -> usize {
        self.coverages.len()
    }

    pub fn coverage(&self, zoom: u32) -> Option<&LevelCoverage> {
        self.coverages.iter().find(|c| c.zoom == zoom)
    }
}

/// A tile request as seen by layer listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRequest {
    pub x: i64,
    pub y: i64,
    pub z: u32,
    pub gridset_id: String,
    pub mime_format: String,
}

impl TileRequest {
    pub fn new(x: i64, y: i64, z: u32, gridset_id: impl Into<String>) -> Self {
        Self {
            x,
            y,
            z,
            gridset_id: gridset_id.into(),
            mime_format: String::new(),
        }
    }

    pub fn with_format(mut self, mime_format: impl Into<String>) -> Self {
        self.mime_format = mime_format.into();
        self
    }
}

// =============================================================================
// Static Tile Layer
// =============================================================================

/// Tile layer with a fixed set of gridsets and formats.
///
/// Request dispatch is done by the embedding server, which calls
/// [`StaticTileLayer::notify`] for every tile it serves.
pub struct StaticTileLayer {
    name: String,
    grid_subsets: Vec<GridSubset>,
    mime_formats: Vec<String>,
    listeners: RwLock<Vec<Arc<dyn TileLayerListener>>>,
}

impl StaticTileLayer {
    pub fn new(
        name: impl Into<String>,
        grid_subsets: Vec<GridSubset>,
        mime_formats: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            grid_subsets,
            mime_formats,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Dispatch a tile request to every registered listener
    pub fn notify(&self, request: &TileRequest) {
        // clone the list so listeners may (de)register while being notified
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.tile_requested(&self.name, request);
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl fmt::Debug for StaticTileLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTileLayer")
            .field("name", &self.name)
            .field("grid_subsets", &self.grid_subsets)
            .field("mime_formats", &self.mime_formats)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl TileLayer for StaticTileLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn grid_subsets(&self) -> Vec<GridSubset> {
        self.grid_subsets.clone()
    }

    fn mime_formats(&self) -> Vec<String> {
        self.mime_formats.clone()
    }

    fn add_listener(&self, listener: Arc<dyn TileLayerListener>) {
        self.listeners.write().push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn TileLayerListener>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }
}

// =============================================================================
// Tests
// =============================================================================
