//! Tile Page Calculator
//!
//! Owns one [`PagePyramid`] per gridset of a layer and bridges page geometry
//! to the tile ranges the truncation collaborator understands.

use std::collections::HashMap;
use std::sync::Arc;

use super::page::{PageIndex, TilePage};
use super::pyramid::PagePyramid;
use crate::domain::layer::GridSubset;
use crate::domain::ports::{GridCoverage, PageRecord};
use crate::domain::quota::LayerQuota;
use crate::error::{Error, Result};

/// Per-layer page lookup across all of its gridsets
#[derive(Debug)]
pub struct TilePageCalculator {
    layer: String,
    gridset_ids: Vec<String>,
    pyramids: HashMap<String, PagePyramid>,
    quota: Arc<LayerQuota>,
}

impl TilePageCalculator {
    /// Build pyramids for every gridset of the layer
    pub fn new(layer: &str, grid_subsets: &[GridSubset], quota: Arc<LayerQuota>) -> Result<Self> {
        if grid_subsets.is_empty() {
            return Err(Error::InvalidAttachment {
                layer: layer.to_string(),
                reason: "layer has no gridsets".to_string(),
            });
        }

        let mut gridset_ids = Vec::with_capacity(grid_subsets.len());
        let mut pyramids = HashMap::with_capacity(grid_subsets.len());
        for subset in grid_subsets {
            if pyramids.contains_key(subset.id()) {
                return Err(Error::InvalidAttachment {
                    layer: layer.to_string(),
                    reason: format!("gridset '{}' is listed twice", subset.id()),
                });
            }
            pyramids.insert(subset.id().to_string(), PagePyramid::new(layer, subset)?);
            gridset_ids.push(subset.id().to_string());
        }

        Ok(Self {
            layer: layer.to_string(),
            gridset_ids,
            pyramids,
            quota,
        })
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Gridset ids in the order the layer declares them
    pub fn gridset_ids(&self) -> &[String] {
        &self.gridset_ids
    }

    pub fn layer_quota(&self) -> &Arc<LayerQuota> {
        &self.quota
    }

    pub fn pyramid(&self, gridset_id: &str) -> Result<&PagePyramid> {
        self.pyramids
            .get(gridset_id)
            .ok_or_else(|| Error::UnknownGridSet {
                layer: self.layer.clone(),
                gridset: gridset_id.to_string(),
            })
    }

    /// Live page holding the tile `(x, y, z)` of `gridset_id`
    pub fn page_for(&self, x: i64, y: i64, z: u32, gridset_id: &str) -> Result<Arc<TilePage>> {
        self.pyramid(gridset_id)?.page_for(x, y, z)
    }

    pub fn live_page(&self, gridset_id: &str, index: PageIndex) -> Result<Option<Arc<TilePage>>> {
        Ok(self.pyramid(gridset_id)?.live_page(index))
    }

    /// Detached snapshot of every page created for `gridset_id`
    pub fn pages(&self, gridset_id: &str) -> Result<Vec<TilePage>> {
        Ok(self.pyramid(gridset_id)?.pages())
    }

    pub fn to_grid_coverage(&self, page: PageIndex, gridset_id: &str) -> Result<GridCoverage> {
        self.pyramid(gridset_id)?.to_grid_coverage(page)
    }

    /// Seed a gridset from persisted records
    pub fn set_pages(&self, gridset_id: &str, records: &[PageRecord]) -> Result<usize> {
        Ok(self.pyramid(gridset_id)?.set_pages(records))
    }

    /// Count a stored tile; returns the new tile count of its page
    pub fn create_tile_info(&self, x: i64, y: i64, z: u32, gridset_id: &str) -> Result<i64> {
        let tiles = self.page_for(x, y, z, gridset_id)?.add_tile();
        self.quota.mark_dirty();
        Ok(tiles)
    }

    /// Count a deleted tile; returns the new tile count of its page
    pub fn remove_tile_info(&self, x: i64, y: i64, z: u32, gridset_id: &str) -> Result<i64> {
        let tiles = self.page_for(x, y, z, gridset_id)?.remove_tile();
        self.quota.mark_dirty();
        Ok(tiles)
    }

    /// Persistable records of every live page of `gridset_id`, in creation order
    pub fn records(&self, gridset_id: &str) -> Result<Vec<PageRecord>> {
        let mut pages = self.pages(gridset_id)?;
        pages.sort_by_key(TilePage::sequence);
        Ok(pages.iter().map(TilePage::to_record).collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
