//! In-Memory Page Store
//!
//! Keeps page snapshots in a `DashMap` and layer usage behind a lock. Used
//! by tests and by embedders that don't need state to survive a restart.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::domain::ports::{PageRecord, PageStore, UsageStore};
use crate::domain::quota::Quota;
use crate::error::{Error, Result};

/// `PageStore` and `UsageStore` backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryPageStore {
    snapshots: DashMap<(String, String), Vec<PageRecord>>,
    usage: RwLock<Option<BTreeMap<String, Quota>>>,
}

impl InMemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored (layer, gridset) snapshots
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Stored snapshot, if any
    pub fn snapshot(&self, layer: &str, gridset_id: &str) -> Option<Vec<PageRecord>> {
        self.snapshots
            .get(&(layer.to_string(), gridset_id.to_string()))
            .map(|e| e.value().clone())
    }
}

#[async_trait]
impl PageStore for InMemoryPageStore {
    async fn load_pages(&self, layer: &str, gridset_id: &str) -> Result<Vec<PageRecord>> {
        self.snapshot(layer, gridset_id)
            .ok_or_else(|| Error::PageStateNotFound(format!("{}/{}", layer, gridset_id)))
    }

    async fn save_pages(&self, layer: &str, gridset_id: &str, pages: &[PageRecord]) -> Result<()> {
        self.snapshots
            .insert((layer.to_string(), gridset_id.to_string()), pages.to_vec());
        Ok(())
    }
}

#[async_trait]
impl UsageStore for InMemoryPageStore {
    async fn load_usage(&self) -> Result<BTreeMap<String, Quota>> {
        self.usage
            .read()
            .clone()
            .ok_or_else(|| Error::PageStateNotFound("usage".into()))
    }

    async fn save_usage(&self, usage: &BTreeMap<String, Quota>) -> Result<()> {
        *self.usage.write() = Some(usage.clone());
        Ok(())
    }
}
