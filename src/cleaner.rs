//! Scheduled Quota Enforcement
//!
//! Periodically walks the attached layers, persists page state and layer
//! usage that changed since the last run, and launches an enforcement task
//! for every layer over its quota.
//!
//! ```text
//!   tick ──▶ usage changed?      ──▶ save layer usage
//!            for each attached layer:
//!              dirty?            ──▶ save page state
//!              globally managed? ──▶ leave to the global run
//!              task in flight?   ──▶ skip
//!              over quota?       ──▶ spawn expire_tiles (bounded by semaphore)
//!            group over the global quota? ──▶ spawn expire_tiles_global
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::accounting::UsageAccountant;
use crate::domain::ports::UsageStore;
use crate::domain::quota::Quota;
use crate::paging::PagedExpirationPolicy;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the cache cleaner
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Time between enforcement runs
    pub cleanup_frequency: Duration,

    /// Maximum enforcement tasks running at once
    pub max_concurrent_cleanups: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            cleanup_frequency: Duration::from_secs(10),
            max_concurrent_cleanups: 2,
        }
    }
}

impl CleanerConfig {
    pub fn with_cleanup_frequency(mut self, frequency: Duration) -> Self {
        self.cleanup_frequency = frequency;
        self
    }

    pub fn with_max_concurrent_cleanups(mut self, max: usize) -> Self {
        self.max_concurrent_cleanups = max.max(1);
        self
    }
}

// =============================================================================
// Cleaner
// =============================================================================

/// Removes a layer from the in-flight set when its task ends
struct InFlightGuard {
    in_flight: Arc<DashSet<String>>,
    layer: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.layer);
    }
}

/// Layers sharing one quota limit
#[derive(Debug, Clone)]
struct GlobalQuota {
    limit: Quota,
    layers: HashSet<String>,
}

/// Runs quota enforcement for attached layers on a schedule
pub struct CacheCleaner {
    config: CleanerConfig,
    policy: Arc<PagedExpirationPolicy>,
    usage: Option<(Arc<UsageAccountant>, Arc<dyn UsageStore>)>,
    global: Option<GlobalQuota>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<DashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    global_task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheCleaner {
    pub fn new(policy: Arc<PagedExpirationPolicy>, config: CleanerConfig) -> Self {
        let permits = config.max_concurrent_cleanups.max(1);
        Self {
            config,
            policy,
            usage: None,
            global: None,
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(DashSet::new()),
            tasks: Mutex::new(Vec::new()),
            global_task: Mutex::new(None),
        }
    }

    /// Save the usage of `accountant` to `store` on every run it changed
    pub fn with_usage_persistence(
        mut self,
        accountant: Arc<UsageAccountant>,
        store: Arc<dyn UsageStore>,
    ) -> Self {
        self.usage = Some((accountant, store));
        self
    }

    /// Enforce `limit` on the combined usage of `layers` instead of per layer
    pub fn with_global_quota(mut self, limit: Quota, layers: impl IntoIterator<Item = String>) -> Self {
        self.global = Some(GlobalQuota {
            limit,
            layers: layers.into_iter().collect(),
        });
        self
    }

    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Whether the global enforcement task is still running
    pub fn is_global_running(&self) -> bool {
        self.global_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Whether an enforcement task for `layer` is still running
    pub fn is_running(&self, layer: &str) -> bool {
        self.in_flight.contains(layer)
    }

    /// Number of enforcement tasks still running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run the schedule until `shutdown` fires, then wait for running tasks
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            frequency_secs = self.config.cleanup_frequency.as_secs_f64(),
            max_concurrent = self.config.max_concurrent_cleanups,
            "Cache cleaner starting"
        );

        let period = self.config.cleanup_frequency;
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Cache cleaner shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let launched = self.run_once().await;
                    if launched > 0 {
                        debug!(launched, "Enforcement tasks launched");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Spawn [`CacheCleaner::run`] on the current runtime
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }

    /// One enforcement round; returns the number of tasks launched
    pub async fn run_once(&self) -> usize {
        self.tasks.lock().retain(|task| !task.is_finished());
        self.save_usage().await;

        let mut launched = 0;
        for layer in self.policy.attached_layers() {
            // detached since the listing
            let Some(quota) = self.policy.layer_quota(&layer) else {
                continue;
            };

            if quota.take_dirty() {
                if let Err(e) = self.policy.save(&layer).await {
                    warn!(layer = %layer, "Failed to save page state: {}", e);
                }
            }

            if self.global.as_ref().is_some_and(|g| g.layers.contains(&layer)) {
                continue;
            }
            if self.in_flight.contains(&layer) {
                debug!(layer = %layer, "Previous enforcement still running");
                continue;
            }

            let over_quota = quota.exceeded().is_some_and(|excess| excess.is_positive());
            if !over_quota {
                continue;
            }
            if !self.in_flight.insert(layer.clone()) {
                continue;
            }

            let guard = InFlightGuard {
                in_flight: Arc::clone(&self.in_flight),
                layer: layer.clone(),
            };
            let policy = Arc::clone(&self.policy);
            let semaphore = Arc::clone(&self.semaphore);

            let task = tokio::spawn(async move {
                let _guard = guard;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        warn!(layer = %layer, "Enforcement cancelled: {}", e);
                        return;
                    }
                };

                match policy.expire_tiles(&layer).await {
                    Ok(report) => debug!(
                        layer = %layer,
                        outcome = %report.outcome,
                        pages = report.pages_expired,
                        "Enforcement task finished"
                    ),
                    Err(e) => error!(layer = %layer, "Enforcement task failed: {}", e),
                }
            });
            self.tasks.lock().push(task);
            launched += 1;
        }

        if let Some(global) = &self.global {
            if self.launch_global(global) {
                launched += 1;
            }
        }
        launched
    }

    async fn save_usage(&self) {
        if let Some((accountant, store)) = &self.usage {
            if let Err(e) = accountant.save_usage(store.as_ref()).await {
                warn!("Failed to save layer usage: {}", e);
            }
        }
    }

    /// Spawn a global enforcement task if the group is over its limit
    fn launch_global(&self, global: &GlobalQuota) -> bool {
        let mut slot = self.global_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Global enforcement still running");
            return false;
        }

        let mut layers: Vec<String> = global
            .layers
            .iter()
            .filter(|layer| self.policy.is_attached(layer))
            .cloned()
            .collect();
        layers.sort();
        let used: i64 = layers
            .iter()
            .filter_map(|layer| self.policy.layer_quota(layer))
            .map(|quota| quota.used_quota().bytes())
            .sum();
        let used = Quota::from_bytes(used);
        if used <= global.limit {
            trace!(used = %used, limit = %global.limit, "Global usage within quota");
            return false;
        }

        info!(
            used = %used,
            limit = %global.limit,
            layers = layers.len(),
            "Global quota exceeded"
        );
        let policy = Arc::clone(&self.policy);
        let semaphore = Arc::clone(&self.semaphore);
        let limit = global.limit;
        *slot = Some(tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!("Global enforcement cancelled: {}", e);
                    return;
                }
            };
            match policy.expire_tiles_global(&layers, limit).await {
                Ok(report) => debug!(
                    outcome = %report.outcome,
                    pages = report.pages_expired,
                    "Global enforcement finished"
                ),
                Err(e) => error!("Global enforcement failed: {}", e),
            }
        }));
        true
    }

    /// Wait for every running enforcement task, then save layer usage
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.extend(self.global_task.lock().take());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Enforcement task panicked: {}", e);
            }
        }
        self.save_usage().await;
    }
}

impl std::fmt::Debug for CacheCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCleaner")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
