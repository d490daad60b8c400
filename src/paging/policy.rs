//! Paged Expiration Policy
//!
//! Attaches layers, records page hits through a layer listener, persists
//! page statistics, and frees disk space by truncating the least valuable
//! page until the layer is back under quota.
//!
//! # Enforcement Loop
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ while usage is still over the goal:                          │
//!   │   for each gridset (round-robin):                            │
//!   │     snapshot pages ─▶ sort by strategy ─▶ first with tiles   │
//!   │        └─▶ page tile range ─▶ truncate, once per format      │
//!   │     re-read the layer quota                                  │
//!   │   stop if the pass found nothing to expire, or no truncated  │
//!   │   page lost a tile                                           │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Truncation runs inline on the calling task; the truncator is expected to
//! lower the layer usage (through the accounting subsystem) before it
//! returns. Usage may keep moving while a run is in progress, so progress is
//! judged by the truncated pages losing tiles rather than by the net usage.
//!
//! Layers without a quota of their own can share a global limit through
//! [`PagedExpirationPolicy::expire_tiles_global`], which ranks the pages of
//! all of them in a single order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::calculator::TilePageCalculator;
use super::clock::CoarseClock;
use super::page::TilePage;
use super::strategy::ExpirationStrategy;
use crate::domain::events::QuotaEvent;
use crate::domain::layer::TileRequest;
use crate::domain::ports::{
    EventPublisher, PageStore, TileLayer, TileLayerListener, TileRange, TileTruncator,
};
use crate::domain::quota::{LayerQuota, Quota};
use crate::error::{Error, Result};
use crate::metrics::QuotaMetrics;

// =============================================================================
// Enforcement Report
// =============================================================================

/// How an enforcement run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationOutcome {
    /// Usage was already within quota; nothing was truncated
    WithinQuota,
    /// Usage dropped back under the quota limit
    QuotaReached,
    /// The requested amount was freed
    LimitReached,
    /// Nothing left to expire, or no truncation removed a tile
    Stalled,
}

impl ExpirationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpirationOutcome::WithinQuota => "WithinQuota",
            ExpirationOutcome::QuotaReached => "QuotaReached",
            ExpirationOutcome::LimitReached => "LimitReached",
            ExpirationOutcome::Stalled => "Stalled",
        }
    }
}

impl fmt::Display for ExpirationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one enforcement run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationReport {
    pub layer: String,
    pub initial_usage: Quota,
    pub final_usage: Quota,
    pub pages_expired: usize,
    pub truncations: usize,
    pub outcome: ExpirationOutcome,
}

impl ExpirationReport {
    fn start(layer: &str, initial_usage: Quota) -> Self {
        Self {
            layer: layer.to_string(),
            initial_usage,
            final_usage: initial_usage,
            pages_expired: 0,
            truncations: 0,
            outcome: ExpirationOutcome::WithinQuota,
        }
    }

    /// Net usage drop over the run
    pub fn freed(&self) -> Quota {
        self.initial_usage.difference(&self.final_usage)
    }
}

/// What an enforcement run is trying to achieve
#[derive(Debug, Clone, Copy)]
enum Goal {
    /// Bring usage under the configured limit
    Quota { limit: Quota },
    /// Lower usage by `amount` from `initial`
    Free { initial: Quota, amount: Quota },
}

impl Goal {
    /// Bytes still to free; not positive once the goal is met
    fn remaining(&self, used: Quota) -> Quota {
        match *self {
            Goal::Quota { limit } => used.difference(&limit),
            Goal::Free { initial, amount } => amount.difference(&initial.difference(&used)),
        }
    }

    fn reached(&self) -> ExpirationOutcome {
        match self {
            Goal::Quota { .. } => ExpirationOutcome::QuotaReached,
            Goal::Free { .. } => ExpirationOutcome::LimitReached,
        }
    }
}

/// Report and metrics label of global quota runs
pub const GLOBAL_QUOTA_LABEL: &str = "(global)";

/// What happened to a page picked for expiration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageExpiry {
    /// The page held no tiles by the time it was reached
    Skipped,
    /// Truncated; `progressed` if the page lost tiles or went away
    Truncated { progressed: bool },
}

// =============================================================================
// Stats Collector
// =============================================================================

/// Layer listener that turns tile requests into page hits
pub struct PagingStatsCollector {
    calculator: Arc<TilePageCalculator>,
    clock: Arc<CoarseClock>,
}

impl PagingStatsCollector {
    pub fn new(calculator: Arc<TilePageCalculator>, clock: Arc<CoarseClock>) -> Self {
        Self { calculator, clock }
    }
}

impl TileLayerListener for PagingStatsCollector {
    fn tile_requested(&self, layer: &str, request: &TileRequest) {
        match self
            .calculator
            .page_for(request.x, request.y, request.z, &request.gridset_id)
        {
            Ok(page) => {
                page.mark_hit(self.clock.now_minutes());
                self.calculator.layer_quota().mark_dirty();
                trace!(layer = %layer, page = %page.index(), "Page hit");
            }
            Err(e) => debug!(layer = %layer, "Ignoring tile request: {}", e),
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

struct AttachedLayer {
    layer: Arc<dyn TileLayer>,
    calculator: Arc<TilePageCalculator>,
    collector: Arc<dyn TileLayerListener>,
    mime_formats: Vec<String>,
}

/// Page-based expiration policy for tile layers
pub struct PagedExpirationPolicy {
    strategy: ExpirationStrategy,
    truncator: Arc<dyn TileTruncator>,
    page_store: Arc<dyn PageStore>,
    clock: Arc<CoarseClock>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    metrics: Option<Arc<QuotaMetrics>>,
    attached: DashMap<String, Arc<AttachedLayer>>,
    save_lock: Mutex<()>,
}

impl PagedExpirationPolicy {
    pub fn new(
        strategy: ExpirationStrategy,
        truncator: Arc<dyn TileTruncator>,
        page_store: Arc<dyn PageStore>,
    ) -> Self {
        Self {
            strategy,
            truncator,
            page_store,
            clock: Arc::new(CoarseClock::system()),
            event_publisher: None,
            metrics: None,
            attached: DashMap::new(),
            save_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<CoarseClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Policy name (`LRU`, `LFU`, ...)
    pub fn name(&self) -> &str {
        self.strategy.name()
    }

    pub fn strategy(&self) -> &ExpirationStrategy {
        &self.strategy
    }

    pub fn clock(&self) -> &Arc<CoarseClock> {
        &self.clock
    }

    /// Refresh the access clock every `period` until `shutdown` fires
    pub fn start_clock(&self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        debug!(policy = %self.name(), period_secs = period.as_secs_f64(), "Starting access clock");
        self.clock.spawn_ticker(period, shutdown)
    }

    /// Names of attached layers, sorted
    pub fn attached_layers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attached.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_attached(&self, layer_name: &str) -> bool {
        self.attached.contains_key(layer_name)
    }

    pub fn layer_quota(&self, layer_name: &str) -> Option<Arc<LayerQuota>> {
        self.attached
            .get(layer_name)
            .map(|e| Arc::clone(e.calculator.layer_quota()))
    }

    /// Detached snapshot of the pages of one gridset
    pub fn pages(&self, layer_name: &str, gridset_id: &str) -> Result<Vec<TilePage>> {
        self.lookup(layer_name)?.calculator.pages(gridset_id)
    }

    /// A tile was stored outside request traffic; returns the page tile count
    pub fn create_tile_info(
        &self,
        layer_name: &str,
        x: i64,
        y: i64,
        z: u32,
        gridset_id: &str,
    ) -> Result<i64> {
        self.lookup(layer_name)?
            .calculator
            .create_tile_info(x, y, z, gridset_id)
    }

    /// A tile was deleted; returns the page tile count
    pub fn remove_tile_info(
        &self,
        layer_name: &str,
        x: i64,
        y: i64,
        z: u32,
        gridset_id: &str,
    ) -> Result<i64> {
        self.lookup(layer_name)?
            .calculator
            .remove_tile_info(x, y, z, gridset_id)
    }

    fn lookup(&self, layer_name: &str) -> Result<Arc<AttachedLayer>> {
        self.attached
            .get(layer_name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::UnknownLayer {
                layer: layer_name.to_string(),
                policy: self.name().to_string(),
            })
    }

    // =========================================================================
    // Attachment
    // =========================================================================

    /// Start tracking `layer` against `quota`.
    ///
    /// Persisted page state is restored per gridset; a gridset whose state is
    /// missing or unreadable starts empty. Re-attaching replaces the previous
    /// attachment and carries its live page state over for every gridset the
    /// layer still serves.
    #[instrument(skip(self, layer, quota), fields(layer = %layer.name()))]
    pub async fn attach(&self, layer: Arc<dyn TileLayer>, quota: Arc<LayerQuota>) -> Result<()> {
        let name = layer.name().to_string();
        let invalid = |reason: &str| Error::InvalidAttachment {
            layer: name.clone(),
            reason: reason.to_string(),
        };

        if quota.layer() != name {
            return Err(invalid(&format!("quota belongs to layer '{}'", quota.layer())));
        }
        if quota.limit().is_none() {
            return Err(invalid("no quota limit configured"));
        }
        let mime_formats = layer.mime_formats();
        if mime_formats.is_empty() {
            return Err(invalid("layer has no tile formats"));
        }

        let calculator = Arc::new(TilePageCalculator::new(
            &name,
            &layer.grid_subsets(),
            Arc::clone(&quota),
        )?);

        let previous = self.attached.get(&name).map(|e| Arc::clone(e.value()));
        let mut pages_restored = 0;
        for gridset_id in calculator.gridset_ids() {
            let live = previous
                .as_ref()
                .and_then(|p| p.calculator.records(gridset_id).ok());
            let loaded = match live {
                Some(records) => Ok(records),
                None => self.page_store.load_pages(&name, gridset_id).await,
            };
            match loaded {
                Ok(records) => {
                    let restored = calculator.set_pages(gridset_id, &records)?;
                    debug!(gridset = %gridset_id, pages = restored, "Restored page state");
                    pages_restored += restored;
                }
                Err(e) if e.is_not_found() => {
                    debug!(gridset = %gridset_id, "No page state yet: {}", e);
                }
                Err(e) => {
                    warn!(gridset = %gridset_id, "Discarding unreadable page state: {}", e);
                }
            }
        }

        let collector: Arc<dyn TileLayerListener> = Arc::new(PagingStatsCollector::new(
            Arc::clone(&calculator),
            Arc::clone(&self.clock),
        ));
        let attached = Arc::new(AttachedLayer {
            layer: Arc::clone(&layer),
            calculator: Arc::clone(&calculator),
            collector: Arc::clone(&collector),
            mime_formats,
        });

        if let Some(previous) = self.attached.insert(name.clone(), attached) {
            previous.layer.remove_listener(&previous.collector);
            info!("Replaced previous attachment");
        }
        layer.add_listener(collector);
        self.update_attached_gauge();

        info!(
            policy = %self.name(),
            gridsets = calculator.gridset_ids().len(),
            pages_restored,
            "Layer attached"
        );
        self.publish(QuotaEvent::LayerAttached {
            layer: name,
            policy: self.name().to_string(),
            gridsets: calculator.gridset_ids().to_vec(),
            pages_restored,
            timestamp: Utc::now(),
        })
        .await;

        Ok(())
    }

    /// Persist and stop tracking a layer; false if it wasn't attached
    #[instrument(skip(self))]
    pub async fn detach(&self, layer_name: &str) -> bool {
        let Some((_, attached)) = self.attached.remove(layer_name) else {
            return false;
        };
        self.update_attached_gauge();

        self.persist(&attached).await;
        attached.layer.remove_listener(&attached.collector);

        info!(policy = %self.name(), "Layer detached");
        self.publish(QuotaEvent::LayerDetached {
            layer: layer_name.to_string(),
            policy: self.name().to_string(),
            timestamp: Utc::now(),
        })
        .await;
        true
    }

    /// Detach every layer, returning how many were attached
    pub async fn detach_all(&self) -> usize {
        let mut detached = 0;
        for name in self.attached_layers() {
            if self.detach(&name).await {
                detached += 1;
            }
        }
        detached
    }

    /// Persist all page state and release every layer
    pub async fn destroy(&self) {
        let detached = self.detach_all().await;
        info!(policy = %self.name(), layers = detached, "Expiration policy shut down");
    }

    /// Persist the page state of every gridset of a layer.
    ///
    /// Store failures are logged per gridset and never returned.
    #[instrument(skip(self))]
    pub async fn save(&self, layer_name: &str) -> Result<()> {
        let attached = self.lookup(layer_name)?;
        self.persist(&attached).await;
        Ok(())
    }

    async fn persist(&self, attached: &AttachedLayer) {
        let _guard = self.save_lock.lock().await;
        let layer = attached.calculator.layer();

        for gridset_id in attached.calculator.gridset_ids() {
            let outcome = match attached.calculator.records(gridset_id) {
                Ok(records) => self
                    .page_store
                    .save_pages(layer, gridset_id, &records)
                    .await
                    .map(|_| records.len()),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(count) => {
                    debug!(layer = %layer, gridset = %gridset_id, pages = count, "Saved page state")
                }
                Err(e) => {
                    warn!(
                        layer = %layer,
                        gridset = %gridset_id,
                        "Failed to save page state: {}",
                        e
                    );
                    self.publish(QuotaEvent::PageStateSaveFailed {
                        layer: layer.to_string(),
                        gridset_id: gridset_id.clone(),
                        reason: e.to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
                }
            }
        }
    }

    // =========================================================================
    // Enforcement
    // =========================================================================

    /// Truncate pages until the layer is back under its quota limit
    #[instrument(skip(self))]
    pub async fn expire_tiles(&self, layer_name: &str) -> Result<ExpirationReport> {
        let attached = self.lookup(layer_name)?;
        let quota = Arc::clone(attached.calculator.layer_quota());
        let Some(limit) = quota.limit() else {
            let report = ExpirationReport::start(layer_name, quota.used_quota());
            return Ok(self.finish(report).await);
        };
        self.enforce(&attached, &quota, Goal::Quota { limit }).await
    }

    /// Truncate pages until usage dropped by `truncate_limit` from its value
    /// at call time, regardless of the quota limit
    #[instrument(skip(self))]
    pub async fn expire_tiles_bounded(
        &self,
        layer_name: &str,
        truncate_limit: Quota,
    ) -> Result<ExpirationReport> {
        let attached = self.lookup(layer_name)?;
        let quota = Arc::clone(attached.calculator.layer_quota());
        let goal = Goal::Free {
            initial: quota.used_quota(),
            amount: truncate_limit,
        };
        self.enforce(&attached, &quota, goal).await
    }

    /// Truncate pages across `layer_names` until their combined usage is
    /// back under `limit`.
    ///
    /// Pages of every listed layer are ranked in one order by the strategy,
    /// so the least valuable page of the whole group goes first.
    #[instrument(skip(self))]
    pub async fn expire_tiles_global(
        &self,
        layer_names: &[String],
        limit: Quota,
    ) -> Result<ExpirationReport> {
        let group = layer_names
            .iter()
            .map(|name| self.lookup(name))
            .collect::<Result<Vec<_>>>()?;
        let used = || {
            Quota::from_bytes(
                group
                    .iter()
                    .map(|a| a.calculator.layer_quota().used_quota().bytes())
                    .sum(),
            )
        };

        let goal = Goal::Quota { limit };
        let mut report = ExpirationReport::start(GLOBAL_QUOTA_LABEL, used());
        let mut remaining = goal.remaining(used());
        if !remaining.is_positive() {
            return Ok(self.finish(report).await);
        }

        info!(
            layers = group.len(),
            used = %report.initial_usage,
            to_free = %remaining,
            "Expiring tiles under the global quota"
        );

        loop {
            let mut candidates = Vec::new();
            for attached in &group {
                for gridset_id in attached.calculator.gridset_ids() {
                    for page in attached.calculator.pages(gridset_id)? {
                        if page.num_tiles_in_page() > 0 {
                            candidates.push((page, attached, gridset_id));
                        }
                    }
                }
            }
            if candidates.is_empty() {
                warn!(remaining = %remaining, "No page holds tiles but global usage is over quota");
                report.outcome = ExpirationOutcome::Stalled;
                break;
            }
            candidates.sort_by(|a, b| self.strategy.compare(&a.0, &b.0));

            let mut progressed = false;
            for (page, attached, gridset_id) in &candidates {
                if !remaining.is_positive() {
                    break;
                }
                match self
                    .expire_page(attached, gridset_id, page, &mut report)
                    .await
                {
                    Ok(PageExpiry::Truncated { progressed: true }) => progressed = true,
                    Ok(_) => {}
                    Err(e) => return Err(self.expiration_failed(attached, gridset_id, e)),
                }
                remaining = goal.remaining(used());
            }

            if !remaining.is_positive() {
                report.outcome = goal.reached();
                break;
            }
            if !progressed {
                warn!(remaining = %remaining, "Truncations removed no tiles, giving up until the next run");
                report.outcome = ExpirationOutcome::Stalled;
                break;
            }
        }

        report.final_usage = used();
        Ok(self.finish(report).await)
    }

    async fn enforce(
        &self,
        attached: &AttachedLayer,
        quota: &LayerQuota,
        goal: Goal,
    ) -> Result<ExpirationReport> {
        let layer = attached.calculator.layer();
        let mut report = ExpirationReport::start(layer, quota.used_quota());

        let mut remaining = goal.remaining(quota.used_quota());
        if !remaining.is_positive() {
            if matches!(goal, Goal::Free { .. }) {
                report.outcome = ExpirationOutcome::LimitReached;
            }
            return Ok(self.finish(report).await);
        }

        info!(
            layer = %layer,
            used = %report.initial_usage,
            to_free = %remaining,
            "Expiring tiles"
        );

        loop {
            let mut expired_in_pass = 0;
            let mut progressed = false;

            for gridset_id in attached.calculator.gridset_ids() {
                if !remaining.is_positive() {
                    break;
                }
                match self.expire_next_page(attached, gridset_id, &mut report).await {
                    Ok(PageExpiry::Skipped) => {}
                    Ok(PageExpiry::Truncated { progressed: lost }) => {
                        expired_in_pass += 1;
                        progressed |= lost;
                    }
                    Err(e) => return Err(self.expiration_failed(attached, gridset_id, e)),
                }
                remaining = goal.remaining(quota.used_quota());
            }

            if !remaining.is_positive() {
                report.outcome = goal.reached();
                break;
            }
            if expired_in_pass == 0 {
                warn!(
                    layer = %layer,
                    remaining = %remaining,
                    "No page holds tiles but usage is still over the goal"
                );
                report.outcome = ExpirationOutcome::Stalled;
                break;
            }
            if !progressed {
                warn!(
                    layer = %layer,
                    remaining = %remaining,
                    "Truncations removed no tiles, giving up until the next run"
                );
                report.outcome = ExpirationOutcome::Stalled;
                break;
            }
        }

        report.final_usage = quota.used_quota();
        Ok(self.finish(report).await)
    }

    fn expiration_failed(&self, attached: &AttachedLayer, gridset_id: &str, e: Error) -> Error {
        let layer = attached.calculator.layer();
        error!(layer = %layer, gridset = %gridset_id, "Tile expiration failed: {}", e);
        if let Some(metrics) = &self.metrics {
            metrics.record_failure(layer);
        }
        e
    }

    /// Truncate the least valuable page of a gridset that still holds tiles
    async fn expire_next_page(
        &self,
        attached: &AttachedLayer,
        gridset_id: &str,
        report: &mut ExpirationReport,
    ) -> Result<PageExpiry> {
        let mut pages = attached.calculator.pages(gridset_id)?;
        self.strategy.sort_pages(&mut pages);
        let Some(page) = pages.iter().find(|p| p.num_tiles_in_page() > 0) else {
            debug!(
                layer = %attached.calculator.layer(),
                gridset = %gridset_id,
                "No page with tiles to expire"
            );
            return Ok(PageExpiry::Skipped);
        };
        self.expire_page(attached, gridset_id, page, report).await
    }

    /// Truncate one page in every format of its layer
    async fn expire_page(
        &self,
        attached: &AttachedLayer,
        gridset_id: &str,
        page: &TilePage,
        report: &mut ExpirationReport,
    ) -> Result<PageExpiry> {
        let calculator = &attached.calculator;
        let layer = calculator.layer();
        let index = page.index();

        let live = calculator.live_page(gridset_id, index)?;
        let tiles_before = live.as_ref().map_or(0, |p| p.num_tiles_in_page());
        if tiles_before <= 0 {
            return Ok(PageExpiry::Skipped);
        }
        let coverage = calculator.to_grid_coverage(index, gridset_id)?;

        for format in &attached.mime_formats {
            let range = TileRange::for_level(layer, gridset_id, coverage.clone(), index.z, format);
            debug!(range = %range, "Truncating page");

            self.truncator
                .truncate(&range)
                .await
                .map_err(|e| match e {
                    Error::TruncationFailed { .. } => e,
                    other => Error::TruncationFailed {
                        layer: layer.to_string(),
                        reason: other.to_string(),
                    },
                })?;

            report.truncations += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_truncation(layer);
            }
            if live.as_ref().map_or(true, |p| p.num_tiles_in_page() <= 0) {
                break;
            }
        }

        let tiles_after = live.as_ref().map_or(0, |p| p.num_tiles_in_page());
        trace!(layer = %layer, page = %index, tiles_before, tiles_after, "Page truncated");

        report.pages_expired += 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_page_expired(layer);
        }
        self.publish(QuotaEvent::PageExpired {
            layer: layer.to_string(),
            gridset_id: gridset_id.to_string(),
            page: index.as_array(),
            tiles_before,
            timestamp: Utc::now(),
        })
        .await;

        Ok(PageExpiry::Truncated {
            progressed: tiles_after < tiles_before,
        })
    }

    async fn finish(&self, report: ExpirationReport) -> ExpirationReport {
        if let Some(metrics) = &self.metrics {
            metrics.record_run(&report.layer, report.outcome.as_str());
        }
        if report.outcome != ExpirationOutcome::WithinQuota {
            info!(
                layer = %report.layer,
                outcome = %report.outcome,
                pages = report.pages_expired,
                freed = %report.freed(),
                used = %report.final_usage,
                "Expiration finished"
            );
            self.publish(QuotaEvent::QuotaEnforced {
                layer: report.layer.clone(),
                initial_usage_bytes: report.initial_usage.bytes(),
                final_usage_bytes: report.final_usage.bytes(),
                pages_expired: report.pages_expired,
                outcome: report.outcome.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        }
        report
    }

    async fn publish(&self, event: QuotaEvent) {
        if let Some(publisher) = &self.event_publisher {
            let event_type = event.event_type();
            if let Err(e) = publisher.publish(event).await {
                warn!(event_type, "Failed to publish event: {}", e);
            }
        }
    }

    fn update_attached_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_attached_layers(self.attached.len());
        }
    }
}

impl fmt::Debug for PagedExpirationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedExpirationPolicy")
            .field("strategy", &self.strategy)
            .field("attached_layers", &self.attached_layers())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryPageStore};
    use crate::domain::layer::{GridSubset, StaticTileLayer};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    /// Records truncations, lowers usage by a fixed amount per call, and
    /// empties the truncated page when wired to a policy.
    struct ScriptedTruncator {
        policy: SyncMutex<Option<std::sync::Weak<PagedExpirationPolicy>>>,
        quota: Arc<LayerQuota>,
        bytes_per_truncation: i64,
        ranges: SyncMutex<Vec<TileRange>>,
        fail: bool,
    }

    impl ScriptedTruncator {
        fn new(quota: Arc<LayerQuota>, bytes_per_truncation: i64) -> Arc<Self> {
            Arc::new(Self {
                policy: SyncMutex::new(None),
                quota,
                bytes_per_truncation,
                ranges: SyncMutex::new(Vec::new()),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl TileTruncator for ScriptedTruncator {
        async fn truncate(&self, range: &TileRange) -> Result<()> {
            if self.fail {
                return Err(Error::Internal("disk on fire".into()));
            }
            self.ranges.lock().push(range.clone());
            self.quota.add_used(-self.bytes_per_truncation);

            let policy = self.policy.lock().as_ref().and_then(|w| w.upgrade());
            if let Some(policy) = policy {
                let level = *range.coverage.level(range.zoom_start).unwrap();
                // every tile of the range lives in the same page
                while policy.remove_tile_info(
                    &range.layer,
                    level.min_x,
                    level.min_y,
                    range.zoom_start,
                    &range.gridset_id,
                )? > 0
                {}
            }
            Ok(())
        }
    }

    fn layer() -> Arc<StaticTileLayer> {
        Arc::new(StaticTileLayer::new(
            "roads",
            vec![GridSubset::doubling("EPSG:4326", 2, 1, 0, 4)],
            vec!["image/png".into()],
        ))
    }

    async fn attached_policy(
        quota: Arc<LayerQuota>,
        truncator: Arc<ScriptedTruncator>,
    ) -> (Arc<PagedExpirationPolicy>, Arc<StaticTileLayer>) {
        let policy = Arc::new(
            PagedExpirationPolicy::new(
                ExpirationStrategy::LeastRecentlyUsed,
                truncator.clone(),
                Arc::new(InMemoryPageStore::new()),
            )
            .with_clock(Arc::new(CoarseClock::fixed(1000))),
        );
        *truncator.policy.lock() = Some(Arc::downgrade(&policy));

        let layer = layer();
        policy.attach(layer.clone(), quota).await.unwrap();
        (policy, layer)
    }

    #[tokio::test]
    async fn test_attach_registers_collector() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        let truncator = ScriptedTruncator::new(quota.clone(), 0);
        let (policy, layer) = attached_policy(quota, truncator).await;

        assert!(policy.is_attached("roads"));
        assert_eq!(layer.listener_count(), 1);

        layer.notify(&TileRequest::new(3, 1, 3, "EPSG:4326"));
        layer.notify(&TileRequest::new(3, 1, 3, "EPSG:4326"));
        layer.notify(&TileRequest::new(99, 99, 3, "EPSG:4326"));

        let pages = policy.pages("roads", "EPSG:4326").unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].num_hits(), 2);
        assert_eq!(pages[0].last_access_minutes(), 1000);

        assert!(policy.detach("roads").await);
        assert!(!policy.detach("roads").await);
        assert_eq!(layer.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_reattach_replaces_listener() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        let truncator = ScriptedTruncator::new(quota.clone(), 0);
        let (policy, layer) = attached_policy(quota.clone(), truncator).await;

        policy.attach(layer.clone(), quota).await.unwrap();
        assert_eq!(layer.listener_count(), 1);
        assert_eq!(policy.attached_layers(), vec!["roads".to_string()]);
    }

    #[tokio::test]
    async fn test_reattach_keeps_live_pages() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        let truncator = ScriptedTruncator::new(quota.clone(), 60);
        let (policy, layer) = attached_policy(quota.clone(), truncator.clone()).await;
        for _ in 0..5 {
            policy.create_tile_info("roads", 0, 0, 2, "EPSG:4326").unwrap();
        }
        quota.add_used(150);

        // nothing was saved, the state comes from the previous attachment
        policy.attach(layer, quota.clone()).await.unwrap();
        let pages = policy.pages("roads", "EPSG:4326").unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].num_tiles_in_page(), 5);

        let report = policy.expire_tiles("roads").await.unwrap();
        assert_eq!(report.outcome, ExpirationOutcome::QuotaReached);
        assert_eq!(report.pages_expired, 1);
        assert_eq!(quota.used_quota(), Quota::from_bytes(90));
    }

    #[tokio::test]
    async fn test_start_clock_advances_access_time() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        let policy = PagedExpirationPolicy::new(
            ExpirationStrategy::default(),
            ScriptedTruncator::new(quota.clone(), 0),
            Arc::new(InMemoryPageStore::new()),
        )
        .with_clock(Arc::new(CoarseClock::fixed(0)));
        let layer = layer();
        policy.attach(layer.clone(), quota).await.unwrap();

        let shutdown = CancellationToken::new();
        let ticker = policy.start_clock(Duration::from_millis(10), shutdown.clone());
        let clock = Arc::clone(policy.clock());
        tokio::time::timeout(Duration::from_secs(5), async {
            while clock.now_minutes() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        layer.notify(&TileRequest::new(0, 0, 1, "EPSG:4326"));
        let pages = policy.pages("roads", "EPSG:4326").unwrap();
        assert!(pages[0].last_access_minutes() > 0);

        shutdown.cancel();
        ticker.await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_rejects_invalid_layers() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        let policy = PagedExpirationPolicy::new(
            ExpirationStrategy::default(),
            ScriptedTruncator::new(quota.clone(), 0),
            Arc::new(InMemoryPageStore::new()),
        );

        let unlimited = Arc::new(LayerQuota::new("roads", None));
        assert_matches!(
            policy.attach(layer(), unlimited).await,
            Err(Error::InvalidAttachment { .. })
        );

        let other = Arc::new(LayerQuota::with_limit("rivers", Quota::from_bytes(1)));
        assert_matches!(
            policy.attach(layer(), other).await,
            Err(Error::InvalidAttachment { .. })
        );

        let no_grids = Arc::new(StaticTileLayer::new("roads", vec![], vec!["image/png".into()]));
        assert_matches!(
            policy.attach(no_grids, quota).await,
            Err(Error::InvalidAttachment { .. })
        );
        assert!(policy.attached_layers().is_empty());
    }

    #[tokio::test]
    async fn test_expire_within_quota_is_noop() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        quota.add_used(80);
        let truncator = ScriptedTruncator::new(quota.clone(), 10);
        let (policy, _layer) = attached_policy(quota, truncator.clone()).await;

        let report = policy.expire_tiles("roads").await.unwrap();
        assert_eq!(report.outcome, ExpirationOutcome::WithinQuota);
        assert_eq!(report.pages_expired, 0);
        assert!(truncator.ranges.lock().is_empty());
    }

    #[tokio::test]
    async fn test_expire_unknown_layer() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        let truncator = ScriptedTruncator::new(quota.clone(), 0);
        let (policy, _layer) = attached_policy(quota, truncator).await;
        assert_matches!(
            policy.expire_tiles("rivers").await,
            Err(Error::UnknownLayer { layer, .. }) if layer == "rivers"
        );
    }

    #[tokio::test]
    async fn test_expire_stalls_without_pages() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        quota.add_used(150);
        let truncator = ScriptedTruncator::new(quota.clone(), 10);
        let (policy, _layer) = attached_policy(quota, truncator.clone()).await;

        let report = policy.expire_tiles("roads").await.unwrap();
        assert_eq!(report.outcome, ExpirationOutcome::Stalled);
        assert!(truncator.ranges.lock().is_empty());
    }

    #[tokio::test]
    async fn test_expire_stalls_when_usage_does_not_drop() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        quota.add_used(150);
        // truncations free nothing and leave the page counters alone
        let truncator = ScriptedTruncator::new(quota.clone(), 0);
        let (policy, _layer) = attached_policy(quota, truncator.clone()).await;
        *truncator.policy.lock() = None;
        policy.create_tile_info("roads", 0, 0, 2, "EPSG:4326").unwrap();

        let report = policy.expire_tiles("roads").await.unwrap();
        assert_eq!(report.outcome, ExpirationOutcome::Stalled);
        assert_eq!(report.pages_expired, 1);
    }

    #[tokio::test]
    async fn test_truncation_failure_propagates() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        quota.add_used(150);
        let truncator = Arc::new(ScriptedTruncator {
            policy: SyncMutex::new(None),
            quota: quota.clone(),
            bytes_per_truncation: 0,
            ranges: SyncMutex::new(Vec::new()),
            fail: true,
        });
        let metrics = Arc::new(QuotaMetrics::new().unwrap());
        let policy = PagedExpirationPolicy::new(
            ExpirationStrategy::default(),
            truncator,
            Arc::new(InMemoryPageStore::new()),
        )
        .with_metrics(metrics.clone());
        policy.attach(layer(), quota).await.unwrap();
        policy.create_tile_info("roads", 0, 0, 1, "EPSG:4326").unwrap();

        assert_matches!(
            policy.expire_tiles("roads").await,
            Err(Error::TruncationFailed { layer, reason })
                if layer == "roads" && reason.contains("disk on fire")
        );
        assert_eq!(metrics.enforcement_failures("roads"), 1);
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let quota = Arc::new(LayerQuota::with_limit("roads", Quota::from_bytes(100)));
        quota.add_used(120);
        let truncator = ScriptedTruncator::new(quota.clone(), 50);
        let events = Arc::new(InMemoryEventCollector::new());
        let policy = Arc::new(
            PagedExpirationPolicy::new(
                ExpirationStrategy::LeastFrequentlyUsed,
                truncator.clone(),
                Arc::new(InMemoryPageStore::new()),
            )
            .with_event_publisher(events.clone()),
        );
        *truncator.policy.lock() = Some(Arc::downgrade(&policy));
        policy.attach(layer(), quota).await.unwrap();
        policy.create_tile_info("roads", 0, 0, 0, "EPSG:4326").unwrap();

        let report = policy.expire_tiles("roads").await.unwrap();
        assert_eq!(report.outcome, ExpirationOutcome::QuotaReached);
        policy.destroy().await;

        assert_eq!(events.events_of_type("LayerAttached").len(), 1);
        assert_eq!(events.events_of_type("PageExpired").len(), 1);
        assert_eq!(events.events_of_type("QuotaEnforced").len(), 1);
        assert_eq!(events.events_of_type("LayerDetached").len(), 1);
    }
}
