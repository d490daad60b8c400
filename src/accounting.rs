//! Usage Accounting
//!
//! Keeps [`LayerQuota`] usage and page tile counts in step with the tile
//! store. The storage backend calls [`UsageAccountant`] whenever it writes,
//! overwrites, or deletes a tile blob.
//!
//! Blob sizes are charged in whole disk blocks:
//!
//! ```text
//! charged = block_size * ceil(blob_size / block_size)
//! ```
//!
//! Usage is restored from a [`UsageStore`] at startup and written back
//! whenever it changed, so it survives restarts alongside the page state.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace};

use crate::domain::layer::TileRequest;
use crate::domain::ports::UsageStore;
use crate::domain::quota::{LayerQuota, Quota};
use crate::error::{Error, Result};
use crate::paging::PagedExpirationPolicy;

/// Default filesystem block size in bytes
pub const DEFAULT_DISK_BLOCK_SIZE: u64 = 4096;

/// Blob-store listener that maintains per-layer usage
pub struct UsageAccountant {
    policy: Arc<PagedExpirationPolicy>,
    quotas: DashMap<String, Arc<LayerQuota>>,
    disk_block_size: u64,
    last_saved: Mutex<Option<BTreeMap<String, Quota>>>,
}

impl UsageAccountant {
    /// Create an accountant charging whole blocks of `disk_block_size` bytes
    pub fn new(policy: Arc<PagedExpirationPolicy>, disk_block_size: u64) -> Result<Self> {
        if disk_block_size == 0 {
            return Err(Error::Config("disk block size must be positive".into()));
        }
        Ok(Self {
            policy,
            quotas: DashMap::new(),
            disk_block_size,
            last_saved: Mutex::new(None),
        })
    }

    pub fn disk_block_size(&self) -> u64 {
        self.disk_block_size
    }

    /// Start accounting for a layer, replacing any previous quota record
    pub fn register(&self, quota: Arc<LayerQuota>) {
        debug!(layer = %quota.layer(), limit = ?quota.limit(), "Accounting layer usage");
        self.quotas.insert(quota.layer().to_string(), quota);
    }

    /// Stop accounting for a layer
    pub fn unregister(&self, layer: &str) -> Option<Arc<LayerQuota>> {
        self.quotas.remove(layer).map(|(_, quota)| quota)
    }

    pub fn layer_quota(&self, layer: &str) -> Option<Arc<LayerQuota>> {
        self.quotas.get(layer).map(|e| Arc::clone(e.value()))
    }

    /// Current usage of a layer
    pub fn used_quota(&self, layer: &str) -> Option<Quota> {
        self.quotas.get(layer).map(|e| e.used_quota())
    }

    /// Usage of every accounted layer
    pub fn usage_snapshot(&self) -> BTreeMap<String, Quota> {
        self.quotas
            .iter()
            .map(|e| (e.key().clone(), e.used_quota()))
            .collect()
    }

    /// Seed accounted layers from the last saved usage.
    ///
    /// Returns the number of layers restored; nothing saved yet is not an
    /// error.
    #[instrument(skip(self, store))]
    pub async fn restore_usage(&self, store: &dyn UsageStore) -> Result<usize> {
        let saved = match store.load_usage().await {
            Ok(saved) => saved,
            Err(e) if e.is_not_found() => {
                debug!("No saved layer usage yet");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut restored = 0;
        for (layer, used) in &saved {
            match self.layer_quota(layer) {
                Some(quota) => {
                    quota.set_used(*used);
                    restored += 1;
                }
                None => debug!(layer = %layer, "Ignoring saved usage of unaccounted layer"),
            }
        }
        *self.last_saved.lock() = Some(self.usage_snapshot());

        info!(layers = restored, "Restored layer usage");
        Ok(restored)
    }

    /// Save usage if it changed since the last save or restore; true when
    /// it was written
    pub async fn save_usage(&self, store: &dyn UsageStore) -> Result<bool> {
        let usage = self.usage_snapshot();
        let unchanged = self.last_saved.lock().as_ref() == Some(&usage);
        if unchanged {
            return Ok(false);
        }

        store.save_usage(&usage).await?;
        debug!(layers = usage.len(), "Saved layer usage");
        *self.last_saved.lock() = Some(usage);
        Ok(true)
    }

    /// Bytes a blob of `blob_size` occupies on disk
    pub fn disk_usage(&self, blob_size: u64) -> i64 {
        let blocks = blob_size.div_ceil(self.disk_block_size);
        (blocks * self.disk_block_size) as i64
    }

    /// A new tile blob was written
    pub fn tile_stored(&self, layer: &str, tile: &TileRequest, blob_size: u64) {
        let Some(quota) = self.layer_quota(layer) else {
            debug!(layer = %layer, "Ignoring store for unaccounted layer");
            return;
        };
        let used = quota.add_used(self.disk_usage(blob_size));
        trace!(layer = %layer, x = tile.x, y = tile.y, z = tile.z, used = %used, "Tile stored");

        self.track_page(layer, tile, true);
    }

    /// A tile blob was deleted
    pub fn tile_deleted(&self, layer: &str, tile: &TileRequest, blob_size: u64) {
        let Some(quota) = self.layer_quota(layer) else {
            debug!(layer = %layer, "Ignoring delete for unaccounted layer");
            return;
        };
        let used = quota.add_used(-self.disk_usage(blob_size));
        trace!(layer = %layer, x = tile.x, y = tile.y, z = tile.z, used = %used, "Tile deleted");

        self.track_page(layer, tile, false);
    }

    /// An existing tile blob was overwritten; the page tile count is unchanged
    pub fn tile_updated(&self, layer: &str, tile: &TileRequest, blob_size: u64, old_size: u64) {
        let Some(quota) = self.layer_quota(layer) else {
            debug!(layer = %layer, "Ignoring update for unaccounted layer");
            return;
        };
        let delta = self.disk_usage(blob_size) - self.disk_usage(old_size);
        if delta != 0 {
            let used = quota.add_used(delta);
            trace!(layer = %layer, delta, used = %used, "Tile updated");
        }
    }

    fn track_page(&self, layer: &str, tile: &TileRequest, stored: bool) {
        let tracked = if stored {
            self.policy
                .create_tile_info(layer, tile.x, tile.y, tile.z, &tile.gridset_id)
        } else {
            self.policy
                .remove_tile_info(layer, tile.x, tile.y, tile.z, &tile.gridset_id)
        };

        match tracked {
            Ok(tiles) => trace!(layer = %layer, tiles, "Page tile count"),
            // layers without a limit are accounted but never paged
            Err(Error::UnknownLayer { .. }) => {}
            Err(e) => debug!(layer = %layer, "Page not tracked: {}", e),
        }
    }
}

impl std::fmt::Debug for UsageAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAccountant")
            .field("disk_block_size", &self.disk_block_size)
            .field("layers", &self.quotas.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
