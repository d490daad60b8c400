//! Disk Quota Monitor
//!
//! Assembles the quota engine from a [`DiskQuotaConfig`] and runs it:
//!
//! ```text
//!   start()
//!     ├─ register every layer with the UsageAccountant
//!     ├─ attach layers under a quota (own or global) to the policy
//!     ├─ restore saved usage from page_store_dir/usage.yaml
//!     ├─ spawn the access clock ticker      (clock_tick_secs)
//!     └─ spawn the CacheCleaner             (cleanup_frequency_secs)
//!
//!   shutdown()
//!     ├─ cancel background tasks and wait for them
//!     ├─ persist page state and detach every layer
//!     └─ save usage
//! ```
//!
//! A disabled configuration builds the components but starts nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::accounting::UsageAccountant;
use crate::adapters::{FilePageStore, LoggingEventPublisher};
use crate::cleaner::CacheCleaner;
use crate::config::DiskQuotaConfig;
use crate::domain::layer::StaticTileLayer;
use crate::domain::ports::{EventPublisher, TileTruncator};
use crate::domain::quota::LayerQuota;
use crate::error::Result;
use crate::metrics::QuotaMetrics;
use crate::paging::PagedExpirationPolicy;

/// Owns the configured layers and the engine components serving them
pub struct DiskQuotaMonitor {
    config: DiskQuotaConfig,
    store: Arc<FilePageStore>,
    policy: Arc<PagedExpirationPolicy>,
    accountant: Arc<UsageAccountant>,
    cleaner: Arc<CacheCleaner>,
    metrics: Arc<QuotaMetrics>,
    layers: DashMap<String, Arc<StaticTileLayer>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl DiskQuotaMonitor {
    /// Build the engine, publishing quota events to the log
    pub fn new(config: DiskQuotaConfig, truncator: Arc<dyn TileTruncator>) -> Result<Self> {
        Self::with_event_publisher(config, truncator, Arc::new(LoggingEventPublisher::new()))
    }

    /// Build the engine with a custom event publisher
    pub fn with_event_publisher(
        config: DiskQuotaConfig,
        truncator: Arc<dyn TileTruncator>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(FilePageStore::new(config.page_store_dir.clone()));
        let metrics = Arc::new(QuotaMetrics::new()?);
        let policy = Arc::new(
            PagedExpirationPolicy::new(config.expiration_strategy()?, truncator, store.clone())
                .with_event_publisher(publisher)
                .with_metrics(metrics.clone()),
        );
        let accountant = Arc::new(UsageAccountant::new(policy.clone(), config.disk_block_size)?);

        let mut cleaner = CacheCleaner::new(policy.clone(), config.cleaner_config())
            .with_usage_persistence(accountant.clone(), store.clone());
        if let Some(limit) = config.global_quota {
            cleaner = cleaner.with_global_quota(limit, config.global_layers());
        }

        Ok(Self {
            config,
            store,
            policy,
            accountant,
            cleaner: Arc::new(cleaner),
            metrics,
            layers: DashMap::new(),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DiskQuotaConfig {
        &self.config
    }

    pub fn policy(&self) -> &Arc<PagedExpirationPolicy> {
        &self.policy
    }

    /// Feed blob store events here
    pub fn accountant(&self) -> &Arc<UsageAccountant> {
        &self.accountant
    }

    pub fn cleaner(&self) -> &Arc<CacheCleaner> {
        &self.cleaner
    }

    pub fn metrics(&self) -> &Arc<QuotaMetrics> {
        &self.metrics
    }

    pub fn page_store(&self) -> &Arc<FilePageStore> {
        &self.store
    }

    /// A configured layer; tile requests are reported through its listeners
    pub fn layer(&self, name: &str) -> Option<Arc<StaticTileLayer>> {
        self.layers.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register the configured layers and start background enforcement
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Disk quota disabled, not starting");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Disk quota monitor already running");
            return Ok(());
        }

        let mut attached = 0;
        for layer_config in &self.config.layers {
            let layer = Arc::new(layer_config.build_layer());
            let quota = match (layer_config.quota, self.config.global_quota) {
                (None, Some(global)) => Arc::new(LayerQuota::with_limit(&layer_config.name, global)),
                _ => layer_config.build_quota(),
            };
            self.accountant.register(quota.clone());

            if quota.limit().is_some() {
                self.policy.attach(layer.clone(), quota).await?;
                attached += 1;
            } else {
                debug!(layer = %layer_config.name, "No quota, accounting only");
            }
            self.layers.insert(layer_config.name.clone(), layer);
        }

        if let Err(e) = self.accountant.restore_usage(self.store.as_ref()).await {
            warn!("Failed to restore layer usage, starting from zero: {}", e);
        }

        {
            let mut tasks = self.tasks.lock();
            tasks.push(
                self.policy
                    .start_clock(self.config.clock_tick(), self.token.child_token()),
            );
            tasks.push(self.cleaner.spawn(self.token.child_token()));
        }

        info!(
            layers = self.config.layers.len(),
            attached,
            policy = %self.policy.name(),
            page_store = %self.store.dir().display(),
            global_quota = ?self.config.global_quota,
            "Disk quota monitor started"
        );
        Ok(())
    }

    /// Stop background tasks, persist page state and usage
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Background task panicked: {}", e);
            }
        }

        self.policy.destroy().await;
        self.accountant.save_usage(self.store.as_ref()).await?;
        info!("Disk quota monitor stopped");
        Ok(())
    }
}

impl std::fmt::Debug for DiskQuotaMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskQuotaMonitor")
            .field("enabled", &self.config.enabled)
            .field("running", &self.is_running())
            .field("layers", &self.layers.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
