//! Page Pyramid
//!
//! Imposes a finite page grid on every zoom level of one gridset and keeps
//! the live pages created for it.
//!
//! # Page Geometry
//!
//! ```text
//!   tiles per page = ceil(n / log_1.3(n))      n = tiles spanning one axis
//!   pages per axis = ceil(n / tiles per page)
//!
//!   n = 1      ->      1 tile per page,   1 page
//!   n = 256    ->     13 tiles per page, 20 pages
//!   n = 2^20   ->  19845 tiles per page, 53 pages
//! ```
//!
//! Deep levels get much larger pages so the page count grows only
//! logarithmically with the tile span.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::page::{PageIndex, TilePage};
use crate::domain::layer::{GridSubset, LevelCoverage};
use crate::domain::ports::{GridCoverage, PageRecord};
use crate::error::{Error, Result};

const PAGE_SIZE_LOG_BASE: f64 = 1.3;

/// Number of tiles along one page edge for an axis spanning `span` tiles
pub fn tiles_per_page(span: u64) -> u64 {
    if span <= 1 {
        return 1;
    }
    let span_f = span as f64;
    let log = span_f.ln() / PAGE_SIZE_LOG_BASE.ln();
    ((span_f / log).ceil() as u64).max(1)
}

/// Number of pages needed to cover `span` tiles
pub fn pages_for(span: u64, tiles_per_page: u64) -> u64 {
    span.div_ceil(tiles_per_page.max(1))
}

// =============================================================================
// Level Geometry
// =============================================================================

/// Page geometry of a single zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLevelInfo {
    pub zoom: u32,
    pub coverage: LevelCoverage,
    pub tiles_per_page_x: u64,
    pub tiles_per_page_y: u64,
    pub pages_x: u64,
    pub pages_y: u64,
}

impl PageLevelInfo {
    fn new(coverage: LevelCoverage) -> Self {
        let span_x = coverage.tiles_wide() as u64;
        let span_y = coverage.tiles_high() as u64;
        let tiles_per_page_x = tiles_per_page(span_x);
        let tiles_per_page_y = tiles_per_page(span_y);

        Self {
            zoom: coverage.zoom,
            coverage,
            tiles_per_page_x,
            tiles_per_page_y,
            pages_x: pages_for(span_x, tiles_per_page_x),
            pages_y: pages_for(span_y, tiles_per_page_y),
        }
    }

    /// Pages in the level
    pub fn pages_per_level(&self) -> u64 {
        self.pages_x.saturating_mul(self.pages_y)
    }

    /// Tiles in one full page
    pub fn tiles_per_page(&self) -> u64 {
        self.tiles_per_page_x.saturating_mul(self.tiles_per_page_y)
    }

    fn contains_page(&self, x: u32, y: u32) -> bool {
        u64::from(x) < self.pages_x && u64::from(y) < self.pages_y
    }
}

// =============================================================================
// Page Pyramid
// =============================================================================

// Iteration order of the page map: deepest zoom first, then descending y and x
type PageKey = Reverse<(u32, u32, u32)>;

fn page_key(index: PageIndex) -> PageKey {
    Reverse((index.z, index.y, index.x))
}

/// Page geometry and live pages for one (layer, gridset) pair
#[derive(Debug)]
pub struct PagePyramid {
    layer: String,
    gridset_id: String,
    first_zoom: u32,
    levels: Vec<PageLevelInfo>,
    pages: RwLock<BTreeMap<PageKey, Arc<TilePage>>>,
    next_sequence: AtomicU64,
}

impl PagePyramid {
    /// Build the pyramid for `grid_subset`.
    ///
    /// Levels must be non-empty, ordered, and contiguous in zoom.
    pub fn new(layer: &str, grid_subset: &GridSubset) -> Result<Self> {
        let coverages = grid_subset.coverages();
        let invalid = |reason: String| Error::InvalidAttachment {
            layer: layer.to_string(),
            reason,
        };

        let first_zoom = coverages
            .first()
            .map(|c| c.zoom)
            .ok_or_else(|| invalid(format!("gridset '{}' has no zoom levels", grid_subset.id())))?;

        let mut levels = Vec::with_capacity(coverages.len());
        for (offset, coverage) in coverages.iter().enumerate() {
            if u64::from(coverage.zoom) != u64::from(first_zoom) + offset as u64 {
                return Err(invalid(format!(
                    "gridset '{}' zoom levels are not contiguous at z{}",
                    grid_subset.id(),
                    coverage.zoom
                )));
            }
            if coverage.tiles_wide() < 1
                || coverage.tiles_high() < 1
                || coverage.min_x < 0
                || coverage.min_y < 0
            {
                return Err(invalid(format!(
                    "gridset '{}' has an empty coverage {}",
                    grid_subset.id(),
                    coverage
                )));
            }

            let info = PageLevelInfo::new(*coverage);
            debug!(
                layer = %layer,
                gridset = %grid_subset.id(),
                zoom = info.zoom,
                tiles_per_page = %format!("{}x{}", info.tiles_per_page_x, info.tiles_per_page_y),
                pages = %format!("{}x{}", info.pages_x, info.pages_y),
                "Page level geometry"
            );
            levels.push(info);
        }

        let pyramid = Self {
            layer: layer.to_string(),
            gridset_id: grid_subset.id().to_string(),
            first_zoom,
            levels,
            pages: RwLock::new(BTreeMap::new()),
            next_sequence: AtomicU64::new(0),
        };

        info!(
            layer = %layer,
            gridset = %pyramid.gridset_id,
            levels = pyramid.levels.len(),
            total_pages = pyramid.total_pages(),
            "Page pyramid created"
        );

        Ok(pyramid)
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn gridset_id(&self) -> &str {
        &self.gridset_id
    }

    pub fn first_zoom(&self) -> u32 {
        self.first_zoom
    }

    pub fn levels(&self) -> &[PageLevelInfo] {
        &self.levels
    }

    pub fn level(&self, zoom: u32) -> Option<&PageLevelInfo> {
        let offset = zoom.checked_sub(self.first_zoom)?;
        self.levels.get(offset as usize)
    }

    /// Maximum number of pages across all levels
    pub fn total_pages(&self) -> u64 {
        self.levels
            .iter()
            .fold(0u64, |acc, l| acc.saturating_add(l.pages_per_level()))
    }

    /// Number of pages created so far
    pub fn num_live_pages(&self) -> usize {
        self.pages.read().len()
    }

    /// Page index of the tile at `(x, y, z)`
    pub fn page_index_for(&self, x: i64, y: i64, z: u32) -> Result<PageIndex> {
        let out_of_coverage = || Error::TileOutOfCoverage {
            gridset: self.gridset_id.clone(),
            x,
            y,
            z,
        };
        let level = self.level(z).ok_or_else(out_of_coverage)?;
        if !level.coverage.contains(x, y) {
            return Err(out_of_coverage());
        }

        let page_x = (x - level.coverage.min_x) as u64 / level.tiles_per_page_x;
        let page_y = (y - level.coverage.min_y) as u64 / level.tiles_per_page_y;
        Ok(PageIndex::new(
            u32::try_from(page_x).map_err(|_| out_of_coverage())?,
            u32::try_from(page_y).map_err(|_| out_of_coverage())?,
            z,
        ))
    }

    /// Live page holding the tile at `(x, y, z)`, created on first use
    pub fn page_for(&self, x: i64, y: i64, z: u32) -> Result<Arc<TilePage>> {
        let index = self.page_index_for(x, y, z)?;
        let key = page_key(index);

        if let Some(page) = self.pages.read().get(&key) {
            return Ok(Arc::clone(page));
        }

        let mut pages = self.pages.write();
        let page = pages.entry(key).or_insert_with(|| {
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            Arc::new(TilePage::new(index).with_sequence(sequence))
        });
        Ok(Arc::clone(page))
    }

    /// Live page at `index`, if it was ever created
    pub fn live_page(&self, index: PageIndex) -> Option<Arc<TilePage>> {
        self.pages.read().get(&page_key(index)).cloned()
    }

    /// Detached copies of every live page, deepest zoom first
    pub fn pages(&self) -> Vec<TilePage> {
        self.pages
            .read()
            .values()
            .map(|page| TilePage::clone(page))
            .collect()
    }

    /// Tile range covered by `page`, clamped to the level coverage
    pub fn to_grid_coverage(&self, page: PageIndex) -> Result<GridCoverage> {
        let level = self
            .level(page.z)
            .filter(|l| l.contains_page(page.x, page.y))
            .ok_or_else(|| {
                Error::Internal(format!(
                    "page {} is outside gridset '{}'",
                    page, self.gridset_id
                ))
            })?;

        let cov = &level.coverage;
        let min_x = cov.min_x + i64::from(page.x) * level.tiles_per_page_x as i64;
        let min_y = cov.min_y + i64::from(page.y) * level.tiles_per_page_y as i64;
        let max_x = (min_x + level.tiles_per_page_x as i64 - 1).min(cov.max_x);
        let max_y = (min_y + level.tiles_per_page_y as i64 - 1).min(cov.max_y);

        Ok(GridCoverage::single_level(LevelCoverage::new(
            min_x, min_y, max_x, max_y, page.z,
        )))
    }

    /// Seed live pages from persisted records, returning how many were kept.
    ///
    /// Records are taken to be in creation order.
    pub fn set_pages(&self, records: &[PageRecord]) -> usize {
        let mut pages = self.pages.write();
        let mut restored = 0;
        for record in records {
            let fits = self
                .level(record.z)
                .is_some_and(|l| l.contains_page(record.x, record.y));
            if !fits {
                warn!(
                    layer = %self.layer,
                    gridset = %self.gridset_id,
                    page = %format!("{},{},{}", record.x, record.y, record.z),
                    "Ignoring persisted page outside the gridset"
                );
                continue;
            }
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            let page = TilePage::from_record(record).with_sequence(sequence);
            pages.insert(page_key(page.index()), Arc::new(page));
            restored += 1;
        }
        restored
    }
}

// =============================================================================
// Tests
// =============================================================================
