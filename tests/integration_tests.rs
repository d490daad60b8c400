//! TileQuota Integration Tests
//!
//! Drives the whole pipeline: an in-memory tile store plays the storage
//! backend, reports blob writes and deletes to the `UsageAccountant`, and
//! serves as the truncation collaborator of the expiration policy.
//!
//! - Eviction until the quota is met, and bounded eviction
//! - Eviction across gridsets, formats, and a shared global quota
//! - Page state persistence across restarts
//! - Snapshot isolation and counter correctness under concurrency
//! - Configuration driven wiring with the scheduled cleaner and the monitor

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use tilequota::adapters::{FilePageStore, InMemoryEventCollector, InMemoryPageStore};
use tilequota::domain::layer::{GridSubset, StaticTileLayer, TileRequest};
use tilequota::domain::ports::{PageStore, TileRange, TileTruncator, UsageStore};
use tilequota::paging::{PageIndex, GLOBAL_QUOTA_LABEL};
use tilequota::{
    CacheCleaner, CoarseClock, DiskQuotaConfig, DiskQuotaMonitor, ExpirationOutcome,
    ExpirationStrategy, LayerQuota, PagedExpirationPolicy, Quota, QuotaMetrics, Result,
    UsageAccountant,
};

const LAYER: &str = "roads";
const GRIDSET: &str = "EPSG:4326";
const PNG: &str = "image/png";
const JPEG: &str = "image/jpeg";
const MERCATOR: &str = "EPSG:900913";

// =============================================================================
// In-memory tile store
// =============================================================================

type TileKey = (String, String, String, i64, i64, u32);

/// Tile blobs by (layer, gridset, format, x, y, z)
#[derive(Default)]
struct MemoryTileStore {
    tiles: DashMap<TileKey, u64>,
    accountant: OnceLock<Weak<UsageAccountant>>,
    /// Tiles (column on row 0 of zoom 6, size) written by a concurrent
    /// seeder, one per truncation
    seeds: Mutex<VecDeque<(i64, u64)>>,
}

impl MemoryTileStore {
    fn bind(&self, accountant: &Arc<UsageAccountant>) {
        let _ = self.accountant.set(Arc::downgrade(accountant));
    }

    fn accountant(&self) -> Option<Arc<UsageAccountant>> {
        self.accountant.get().and_then(Weak::upgrade)
    }

    fn put(&self, layer: &str, x: i64, y: i64, z: u32, size: u64) {
        self.put_tile(layer, GRIDSET, PNG, x, y, z, size);
    }

    #[allow(clippy::too_many_arguments)]
    fn put_tile(&self, layer: &str, gridset: &str, format: &str, x: i64, y: i64, z: u32, size: u64) {
        let key = (layer.into(), gridset.into(), format.into(), x, y, z);
        let previous = self.tiles.insert(key, size);
        if let Some(accountant) = self.accountant() {
            let tile = TileRequest::new(x, y, z, gridset).with_format(format);
            match previous {
                Some(old) => accountant.tile_updated(layer, &tile, size, old),
                None => accountant.tile_stored(layer, &tile, size),
            }
        }
    }

    fn count(&self, layer: &str) -> usize {
        self.tiles.iter().filter(|e| e.key().0 == layer).count()
    }

    fn count_in(&self, layer: &str, gridset: &str) -> usize {
        self.tiles
            .iter()
            .filter(|e| e.key().0 == layer && e.key().1 == gridset)
            .count()
    }

    fn seed_during_truncation(&self, tiles: impl IntoIterator<Item = (i64, u64)>) {
        self.seeds.lock().extend(tiles);
    }
}

#[async_trait]
impl TileTruncator for MemoryTileStore {
    async fn truncate(&self, range: &TileRange) -> Result<()> {
        let doomed: Vec<TileKey> = self
            .tiles
            .iter()
            .map(|e| e.key().clone())
            .filter(|(layer, gridset, format, x, y, z)| {
                *layer == range.layer
                    && *gridset == range.gridset_id
                    && *format == range.mime_format
                    && range.contains(*x, *y, *z)
            })
            .collect();

        let accountant = self.accountant();
        for key in doomed {
            if let Some(((layer, gridset, format, x, y, z), size)) = self.tiles.remove(&key) {
                if let Some(accountant) = &accountant {
                    let tile = TileRequest::new(x, y, z, gridset).with_format(format);
                    accountant.tile_deleted(&layer, &tile, size);
                }
            }
        }

        let seed = self.seeds.lock().pop_front();
        if let Some((x, size)) = seed {
            self.put_tile(&range.layer, &range.gridset_id, &range.mime_format, x, 0, 6, size);
        }
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    policy: Arc<PagedExpirationPolicy>,
    accountant: Arc<UsageAccountant>,
    store: Arc<MemoryTileStore>,
    layer: Arc<StaticTileLayer>,
    quota: Arc<LayerQuota>,
    clock: Arc<CoarseClock>,
}

fn roads_layer() -> Arc<StaticTileLayer> {
    // zoom 6 is 128x64 tiles, paged as 7x5 tiles per page
    Arc::new(StaticTileLayer::new(
        LAYER,
        vec![GridSubset::doubling(GRIDSET, 2, 1, 0, 6)],
        vec![PNG.into()],
    ))
}

async fn harness(
    strategy: ExpirationStrategy,
    limit: i64,
    page_store: Arc<dyn PageStore>,
) -> Harness {
    harness_with(strategy, limit, page_store, roads_layer()).await
}

async fn harness_with(
    strategy: ExpirationStrategy,
    limit: i64,
    page_store: Arc<dyn PageStore>,
    layer: Arc<StaticTileLayer>,
) -> Harness {
    let clock = Arc::new(CoarseClock::fixed(1));
    let store = Arc::new(MemoryTileStore::default());
    let policy = Arc::new(
        PagedExpirationPolicy::new(strategy, store.clone(), page_store).with_clock(clock.clone()),
    );
    // block size 1 charges exact blob sizes
    let accountant = Arc::new(UsageAccountant::new(policy.clone(), 1).unwrap());
    store.bind(&accountant);

    let quota = Arc::new(LayerQuota::with_limit(LAYER, Quota::from_bytes(limit)));
    policy.attach(layer.clone(), quota.clone()).await.unwrap();
    accountant.register(quota.clone());

    Harness {
        policy,
        accountant,
        store,
        layer,
        quota,
        clock,
    }
}

impl Harness {
    /// Store `count` tiles of `size` bytes along row 0 starting at column `x`
    fn fill(&self, x: i64, count: i64, size: u64) {
        for i in 0..count {
            self.store.put(LAYER, x + i, 0, 6, size);
        }
    }

    fn hit(&self, x: i64, y: i64, z: u32, minute: u32) {
        self.hit_in(GRIDSET, x, y, z, minute);
    }

    fn hit_in(&self, gridset: &str, x: i64, y: i64, z: u32, minute: u32) {
        self.clock.set_minutes(minute);
        self.layer.notify(&TileRequest::new(x, y, z, gridset).with_format(PNG));
    }

    /// Three pages on zoom 6 holding 5, 3 and 2 tiles, least recently used first
    fn three_pages(&self, sizes: [u64; 3]) {
        self.fill(0, 5, sizes[0]); // page (0,0,6)
        self.fill(7, 3, sizes[1]); // page (1,0,6)
        self.fill(14, 2, sizes[2]); // page (2,0,6)
        self.hit(0, 0, 6, 10);
        self.hit(7, 0, 6, 20);
        self.hit(14, 0, 6, 30);
    }

    fn page_tiles(&self) -> Vec<([u32; 3], i64)> {
        self.policy
            .pages(LAYER, GRIDSET)
            .unwrap()
            .iter()
            .map(|p| (p.index().as_array(), p.num_tiles_in_page()))
            .collect()
    }
}

// =============================================================================
// Eviction
// =============================================================================

mod eviction_tests {
    use super::*;

    #[tokio::test]
    async fn test_eviction_stops_once_quota_is_met() {
        let h = harness(
            ExpirationStrategy::LeastRecentlyUsed,
            100,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        h.three_pages([6, 10, 45]);
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(150));

        let report = h.policy.expire_tiles(LAYER).await.unwrap();

        assert_eq!(report.outcome, ExpirationOutcome::QuotaReached);
        assert_eq!(report.pages_expired, 2);
        assert_eq!(report.truncations, 2);
        assert_eq!(report.initial_usage, Quota::from_bytes(150));
        assert_eq!(report.final_usage, Quota::from_bytes(90));
        assert_eq!(report.freed(), Quota::from_bytes(60));
        assert!(!h.quota.exceeded().unwrap().is_positive());

        // the most recently used page survives
        assert_eq!(h.store.count(LAYER), 2);
        assert_eq!(
            h.page_tiles(),
            vec![([2, 0, 6], 2), ([1, 0, 6], 0), ([0, 0, 6], 0)]
        );
    }

    #[tokio::test]
    async fn test_lfu_evicts_least_hit_page() {
        let h = harness(
            ExpirationStrategy::LeastFrequentlyUsed,
            100,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        h.three_pages([6, 10, 45]);
        for minute in 40..45 {
            h.hit(0, 0, 6, minute);
            h.hit(7, 0, 6, minute);
        }

        let report = h.policy.expire_tiles(LAYER).await.unwrap();

        assert_eq!(report.outcome, ExpirationOutcome::QuotaReached);
        assert_eq!(report.pages_expired, 1);
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(60));
        assert_eq!(h.store.count(LAYER), 8);
    }

    #[tokio::test]
    async fn test_fifo_evicts_oldest_page() {
        let h = harness(
            ExpirationStrategy::FirstInFirstOut,
            100,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        // created C, B, A; A is least recently used but newest
        h.fill(14, 2, 30);
        h.fill(7, 3, 10);
        h.fill(0, 5, 12);
        h.hit(0, 0, 6, 1);

        let report = h.policy.expire_tiles(LAYER).await.unwrap();

        assert_eq!(report.pages_expired, 1);
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(90));
        assert_eq!(
            h.page_tiles(),
            vec![([2, 0, 6], 0), ([1, 0, 6], 3), ([0, 0, 6], 5)]
        );
    }

    #[tokio::test]
    async fn test_bounded_eviction_stops_at_the_limit() {
        let h = harness(
            ExpirationStrategy::LeastRecentlyUsed,
            100,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        h.three_pages([6, 10, 70]);
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(200));

        let report = h
            .policy
            .expire_tiles_bounded(LAYER, Quota::from_bytes(50))
            .await
            .unwrap();

        assert_eq!(report.outcome, ExpirationOutcome::LimitReached);
        assert_eq!(report.pages_expired, 2);
        assert!(report.freed() >= Quota::from_bytes(50));
        // still over quota, but the bounded run is done
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(140));
        assert!(h.quota.exceeded().unwrap().is_positive());
    }

    #[tokio::test]
    async fn test_bounded_eviction_with_zero_limit_is_noop() {
        let h = harness(
            ExpirationStrategy::LeastRecentlyUsed,
            100,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        h.three_pages([6, 10, 70]);

        let report = h
            .policy
            .expire_tiles_bounded(LAYER, Quota::ZERO)
            .await
            .unwrap();
        assert_eq!(report.pages_expired, 0);
        assert_eq!(h.store.count(LAYER), 10);
    }

    #[tokio::test]
    async fn test_eviction_stalls_when_accounting_disagrees() {
        let h = harness(
            ExpirationStrategy::LeastRecentlyUsed,
            100,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        h.three_pages([6, 10, 14]);
        // usage the tile store knows nothing about
        h.quota.add_used(150);

        let report = h.policy.expire_tiles(LAYER).await.unwrap();

        assert_eq!(report.outcome, ExpirationOutcome::Stalled);
        assert_eq!(report.pages_expired, 3);
        assert_eq!(h.store.count(LAYER), 0);
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(150));
    }

    #[tokio::test]
    async fn test_within_quota_does_nothing() {
        let h = harness(
            ExpirationStrategy::LeastRecentlyUsed,
            1000,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        h.three_pages([6, 10, 14]);

        let report = h.policy.expire_tiles(LAYER).await.unwrap();
        assert_eq!(report.outcome, ExpirationOutcome::WithinQuota);
        assert_eq!(h.store.count(LAYER), 10);
    }

    #[tokio::test]
    async fn test_eviction_continues_while_tiles_are_seeded() {
        let h = harness(
            ExpirationStrategy::LeastRecentlyUsed,
            100,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        // one 30 byte tile in each of pages (10,0,6) to (14,0,6)
        for x in [70, 77, 84, 91, 98] {
            h.store.put(LAYER, x, 0, 6, 30);
        }
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(150));
        // the first three truncations each race a new 30 byte tile into pages 0 to 2
        h.store.seed_during_truncation([(0, 30), (7, 30), (14, 30)]);

        let report = h.policy.expire_tiles(LAYER).await.unwrap();

        assert_eq!(report.outcome, ExpirationOutcome::QuotaReached);
        assert_eq!(report.pages_expired, 5);
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(90));
        assert_eq!(h.store.count(LAYER), 3);
        let holding: Vec<[u32; 3]> = h
            .page_tiles()
            .into_iter()
            .filter(|(_, tiles)| *tiles > 0)
            .map(|(index, _)| index)
            .collect();
        assert_eq!(holding, vec![[2, 0, 6], [1, 0, 6], [0, 0, 6]]);
    }

    #[tokio::test]
    async fn test_eviction_takes_turns_across_gridsets() {
        // zoom 6 of EPSG:900913 is 64x64 tiles, paged as 5x5
        let layer = Arc::new(StaticTileLayer::new(
            LAYER,
            vec![
                GridSubset::doubling(GRIDSET, 2, 1, 0, 6),
                GridSubset::doubling(MERCATOR, 1, 1, 0, 6),
            ],
            vec![PNG.into()],
        ));
        let h = harness_with(
            ExpirationStrategy::LeastRecentlyUsed,
            40,
            Arc::new(InMemoryPageStore::new()),
            layer,
        )
        .await;
        for x in 0..3 {
            h.store.put_tile(LAYER, GRIDSET, PNG, x, 0, 6, 10);
            h.store.put_tile(LAYER, GRIDSET, PNG, x + 7, 0, 6, 10);
            h.store.put_tile(LAYER, MERCATOR, PNG, x, 0, 6, 10);
        }
        h.hit_in(GRIDSET, 0, 0, 6, 10);
        h.hit_in(GRIDSET, 7, 0, 6, 40);
        h.hit_in(MERCATOR, 0, 0, 6, 50);
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(90));

        let report = h.policy.expire_tiles(LAYER).await.unwrap();

        // one page per gridset, so the mercator page goes before the
        // less recently used second page of EPSG:4326
        assert_eq!(report.outcome, ExpirationOutcome::QuotaReached);
        assert_eq!(report.pages_expired, 2);
        assert_eq!(h.quota.used_quota(), Quota::from_bytes(30));
        assert_eq!(h.store.count_in(LAYER, GRIDSET), 3);
        assert_eq!(h.store.count_in(LAYER, MERCATOR), 0);
        assert_eq!(h.page_tiles(), vec![([1, 0, 6], 3), ([0, 0, 6], 0)]);
    }

    #[tokio::test]
    async fn test_each_format_is_truncated_until_the_page_is_empty() {
        let layer = Arc::new(StaticTileLayer::new(
            LAYER,
            vec![GridSubset::doubling(GRIDSET, 2, 1, 0, 6)],
            vec![PNG.into(), JPEG.into()],
        ));
        let h = harness_with(
            ExpirationStrategy::LeastRecentlyUsed,
            15,
            Arc::new(InMemoryPageStore::new()),
            layer,
        )
        .await;
        h.store.put_tile(LAYER, GRIDSET, PNG, 0, 0, 6, 10);
        h.store.put_tile(LAYER, GRIDSET, PNG, 1, 0, 6, 10);
        h.store.put_tile(LAYER, GRIDSET, PNG, 7, 0, 6, 10);
        h.store.put_tile(LAYER, GRIDSET, JPEG, 8, 0, 6, 10);
        h.hit(0, 0, 6, 10);
        h.hit(7, 0, 6, 20);

        let report = h.policy.expire_tiles(LAYER).await.unwrap();

        // the first page empties after its png pass, the second needs both
        assert_eq!(report.outcome, ExpirationOutcome::QuotaReached);
        assert_eq!(report.pages_expired, 2);
        assert_eq!(report.truncations, 3);
        assert_eq!(h.quota.used_quota(), Quota::ZERO);
        assert_eq!(h.store.count(LAYER), 0);
    }
}

// =============================================================================
// Global Quota
// =============================================================================

mod global_quota_tests {
    use super::*;

    #[tokio::test]
    async fn test_global_quota_expires_across_layers() {
        let h = harness(
            ExpirationStrategy::LeastRecentlyUsed,
            100,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        let rivers = Arc::new(StaticTileLayer::new(
            "rivers",
            vec![GridSubset::doubling(GRIDSET, 2, 1, 0, 6)],
            vec![PNG.into()],
        ));
        let rivers_quota = Arc::new(LayerQuota::with_limit("rivers", Quota::from_bytes(100)));
        h.policy.attach(rivers.clone(), rivers_quota.clone()).await.unwrap();
        h.accountant.register(rivers_quota.clone());

        h.fill(0, 2, 30);
        h.store.put("rivers", 0, 0, 6, 30);
        h.store.put("rivers", 1, 0, 6, 30);
        h.hit(0, 0, 6, 10);
        h.clock.set_minutes(20);
        rivers.notify(&TileRequest::new(0, 0, 6, GRIDSET).with_format(PNG));

        // each layer is within its own limit
        let report = h.policy.expire_tiles(LAYER).await.unwrap();
        assert_eq!(report.outcome, ExpirationOutcome::WithinQuota);

        let layers = vec![LAYER.to_string(), "rivers".to_string()];
        let report = h
            .policy
            .expire_tiles_global(&layers, Quota::from_bytes(100))
            .await
            .unwrap();

        assert_eq!(report.layer, GLOBAL_QUOTA_LABEL);
        assert_eq!(report.outcome, ExpirationOutcome::QuotaReached);
        assert_eq!(report.pages_expired, 1);
        assert_eq!(report.initial_usage, Quota::from_bytes(120));
        assert_eq!(report.final_usage, Quota::from_bytes(60));
        assert_eq!(h.store.count(LAYER), 0);
        assert_eq!(h.store.count("rivers"), 2);
        assert_eq!(rivers_quota.used_quota(), Quota::from_bytes(60));
    }

    #[tokio::test]
    async fn test_global_quota_within_limit() {
        let h = harness(
            ExpirationStrategy::LeastRecentlyUsed,
            100,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        h.fill(0, 2, 30);

        let report = h
            .policy
            .expire_tiles_global(&[LAYER.to_string()], Quota::from_bytes(100))
            .await
            .unwrap();
        assert_eq!(report.outcome, ExpirationOutcome::WithinQuota);
        assert_eq!(h.store.count(LAYER), 2);
    }
}

// =============================================================================
// Persistence
// =============================================================================

mod persistence_tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_page_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let page_store: Arc<dyn PageStore> = Arc::new(FilePageStore::new(dir.path()));

        let h = harness(ExpirationStrategy::default(), 1000, page_store.clone()).await;
        h.three_pages([6, 10, 14]);
        h.hit(0, 0, 6, 50);
        let before = h.policy.pages(LAYER, GRIDSET).unwrap();
        assert!(h.policy.detach(LAYER).await);
        assert_eq!(h.layer.listener_count(), 0);
        assert!(dir.path().join("roads.EPSG4326.pages").exists());

        let restarted = harness(ExpirationStrategy::default(), 1000, page_store).await;
        let after = restarted.policy.pages(LAYER, GRIDSET).unwrap();

        assert_eq!(after.len(), 3);
        let records = |pages: &[tilequota::paging::TilePage]| {
            pages.iter().map(|p| p.to_record()).collect::<Vec<_>>()
        };
        assert_eq!(records(&after[..]), records(&before[..]));
        assert_eq!(after[2].num_hits(), 2);
        assert_eq!(after[2].last_access_minutes(), 50);
    }

    #[tokio::test]
    async fn test_corrupt_or_missing_state_starts_empty() {
        let dir = TempDir::new().unwrap();
        let page_store = Arc::new(FilePageStore::new(dir.path()));
        std::fs::write(page_store.page_file(LAYER, GRIDSET), b"TQPG garbage").unwrap();

        let h = harness(ExpirationStrategy::default(), 1000, page_store.clone()).await;
        assert!(h.policy.pages(LAYER, GRIDSET).unwrap().is_empty());

        // a save replaces the corrupt file
        h.fill(0, 1, 1);
        h.policy.save(LAYER).await.unwrap();
        assert_eq!(page_store.load_pages(LAYER, GRIDSET).await.unwrap().len(), 1);

        let empty_dir = TempDir::new().unwrap();
        let fresh = harness(
            ExpirationStrategy::default(),
            1000,
            Arc::new(FilePageStore::new(empty_dir.path().join("nested"))),
        )
        .await;
        assert!(fresh.policy.pages(LAYER, GRIDSET).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fifo_order_survives_restart() {
        let page_store: Arc<dyn PageStore> = Arc::new(InMemoryPageStore::new());

        let h = harness(ExpirationStrategy::FirstInFirstOut, 100, page_store.clone()).await;
        h.fill(14, 2, 1);
        h.fill(0, 5, 1);
        h.policy.destroy().await;

        let restarted = harness(ExpirationStrategy::FirstInFirstOut, 100, page_store).await;
        let mut pages = restarted.policy.pages(LAYER, GRIDSET).unwrap();
        restarted.policy.strategy().sort_pages(&mut pages);
        let order: Vec<PageIndex> = pages.iter().map(|p| p.index()).collect();
        assert_eq!(order, vec![PageIndex::new(2, 0, 6), PageIndex::new(0, 0, 6)]);
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_later_hits() {
        let h = harness(
            ExpirationStrategy::default(),
            1000,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        h.hit(3, 3, 6, 5);

        let snapshot = h.policy.pages(LAYER, GRIDSET).unwrap();
        h.hit(3, 3, 6, 6);
        h.hit(3, 3, 6, 7);
        h.fill(3, 1, 1);

        assert_eq!(snapshot[0].num_hits(), 1);
        assert_eq!(snapshot[0].last_access_minutes(), 5);
        assert_eq!(snapshot[0].num_tiles_in_page(), 0);

        let live = h.policy.pages(LAYER, GRIDSET).unwrap();
        assert_eq!(live[0].num_hits(), 3);
        assert_eq!(live[0].num_tiles_in_page(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_hits_and_tile_counts() {
        let h = harness(
            ExpirationStrategy::default(),
            1 << 30,
            Arc::new(InMemoryPageStore::new()),
        )
        .await;
        let threads = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let layer = h.layer.clone();
                let accountant = h.accountant.clone();
                std::thread::spawn(move || {
                    let tile = TileRequest::new(1, 1, 6, GRIDSET).with_format(PNG);
                    for i in 0..per_thread {
                        layer.notify(&tile);
                        accountant.tile_stored(LAYER, &tile, 10);
                        if i % 2 == 0 {
                            accountant.tile_deleted(LAYER, &tile, 10);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let pages = h.policy.pages(LAYER, GRIDSET).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].num_hits(), (threads * per_thread) as u64);
        assert_eq!(pages[0].num_tiles_in_page(), (threads * per_thread / 2) as i64);
        assert_eq!(
            h.quota.used_quota(),
            Quota::from_bytes((threads * per_thread / 2 * 10) as i64)
        );
    }
}

// =============================================================================
// Cross-Feature Tests
// =============================================================================

mod cross_feature_tests {
    use super::*;

    const CONFIG: &str = r#"
cleanup_frequency_secs: 1
max_concurrent_cleanups: 1
disk_block_size: 1
policy: LRU
layers:
  - name: roads
    quota: 100 B
    formats: [image/png]
    gridsets:
      - id: EPSG:4326
        tiles_wide: 2
        tiles_high: 1
        zoom_stop: 6
  - name: basemap
    formats: [image/png]
    gridsets:
      - id: EPSG:4326
        tiles_wide: 2
        tiles_high: 1
        zoom_stop: 2
"#;

    #[tokio::test]
    async fn test_configured_pipeline_with_cleaner() {
        let config = DiskQuotaConfig::from_yaml_str(CONFIG).unwrap();
        let events = Arc::new(InMemoryEventCollector::new());
        let metrics = Arc::new(QuotaMetrics::new().unwrap());
        let store = Arc::new(MemoryTileStore::default());

        let policy = Arc::new(
            PagedExpirationPolicy::new(
                config.expiration_strategy().unwrap(),
                store.clone(),
                Arc::new(InMemoryPageStore::new()),
            )
            .with_event_publisher(events.clone())
            .with_metrics(metrics.clone()),
        );
        let accountant =
            Arc::new(UsageAccountant::new(policy.clone(), config.disk_block_size).unwrap());
        store.bind(&accountant);

        for layer_config in &config.layers {
            let quota = layer_config.build_quota();
            accountant.register(quota.clone());
            if quota.limit().is_some() {
                policy
                    .attach(Arc::new(layer_config.build_layer()), quota)
                    .await
                    .unwrap();
            }
        }
        assert_eq!(policy.attached_layers(), vec![LAYER.to_string()]);
        assert_eq!(metrics.attached_layers(), 1);

        for x in 0..15 {
            store.put(LAYER, x, 0, 6, 10);
        }
        store.put("basemap", 0, 0, 0, 500);
        assert_eq!(accountant.used_quota(LAYER), Some(Quota::from_bytes(150)));
        assert_eq!(accountant.used_quota("basemap"), Some(Quota::from_bytes(500)));

        let cleaner = CacheCleaner::new(policy.clone(), config.cleaner_config());
        assert_eq!(cleaner.run_once().await, 1);
        cleaner.shutdown().await;

        // pages of 7 tiles: (2,0,6) holds one tile, then (1,0,6) holds seven
        assert_eq!(accountant.used_quota(LAYER), Some(Quota::from_bytes(70)));
        assert_eq!(accountant.used_quota("basemap"), Some(Quota::from_bytes(500)));
        assert_eq!(store.count("basemap"), 1);

        assert_eq!(metrics.pages_expired(LAYER), 2);
        assert_eq!(metrics.enforcement_runs(LAYER, "QuotaReached"), 1);
        assert_eq!(events.events_of_type("PageExpired").len(), 2);
        assert_eq!(events.events_of_type("QuotaEnforced").len(), 1);

        policy.destroy().await;
        assert_eq!(metrics.attached_layers(), 0);
        assert_eq!(events.events_of_type("LayerDetached").len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_enforces_layer_and_global_quotas() {
        let dir = tempfile::TempDir::new().unwrap();
        let yaml = format!(
            "page_store_dir: {}\nglobal_quota: 100 B\n{}",
            dir.path().display(),
            CONFIG.trim_start().replace("cleanup_frequency_secs: 1", "cleanup_frequency_secs: 3600")
        );
        let config = DiskQuotaConfig::from_yaml_str(&yaml).unwrap();
        let store = Arc::new(MemoryTileStore::default());
        let monitor = DiskQuotaMonitor::new(config, store.clone()).unwrap();
        store.bind(monitor.accountant());

        monitor.start().await.unwrap();
        assert_eq!(
            monitor.policy().attached_layers(),
            vec!["basemap".to_string(), LAYER.to_string()]
        );

        for x in 0..15 {
            store.put(LAYER, x, 0, 6, 10);
        }
        store.put("basemap", 0, 0, 2, 150);

        // roads over its own quota, basemap over the global one
        assert_eq!(monitor.cleaner().run_once().await, 2);
        monitor.shutdown().await.unwrap();

        let accountant = monitor.accountant();
        assert_eq!(accountant.used_quota(LAYER), Some(Quota::from_bytes(70)));
        assert_eq!(accountant.used_quota("basemap"), Some(Quota::ZERO));
        assert_eq!(monitor.metrics().pages_expired("basemap"), 1);

        let saved = monitor.page_store().load_usage().await.unwrap();
        assert_eq!(saved.get(LAYER), Some(&Quota::from_bytes(70)));
        assert_eq!(saved.get("basemap"), Some(&Quota::ZERO));
        assert!(monitor.page_store().page_file(LAYER, GRIDSET).exists());
    }
}
