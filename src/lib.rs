//! TileQuota - Paged Disk Quota Engine for Tile Caches
//!
//! Tracks how much disk every cached tile layer uses and evicts the least
//! valuable tiles when a layer goes over its quota. Each gridset of a layer
//! is split into a bounded pyramid of pages; page hit statistics decide
//! which page is truncated next.
//!
//! # Architecture
//!
//! ```text
//!  tile requests              blob store events
//!       │                           │
//!       ▼                           ▼
//! ┌───────────────┐         ┌────────────────┐
//! │ StatsCollector│         │ UsageAccountant│──▶ LayerQuota (used bytes)
//! └───────┬───────┘         └───────┬────────┘
//!         ▼                         ▼
//! ┌─────────────────────────────────────────┐      ┌──────────────┐
//! │          PagedExpirationPolicy          │◀─────│ CacheCleaner │
//! │  TilePageCalculator ─▶ PagePyramid(s)   │      └──────────────┘
//! └───────┬───────────────────────┬─────────┘
//!         ▼                       ▼
//!    PageStore               TileTruncator
//! ```
//!
//! [`DiskQuotaMonitor`] wires these together from a [`DiskQuotaConfig`].
//!
//! # Modules
//!
//! - [`accounting`] - Blob-size accounting into layer quotas
//! - [`adapters`] - Page store and event publisher implementations
//! - [`cleaner`] - Scheduled quota enforcement
//! - [`config`] - YAML configuration
//! - [`domain`] - Ports, events, and value objects
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`monitor`] - Engine assembly and lifecycle
//! - [`paging`] - Page pyramids, strategies, and the expiration policy

pub mod accounting;
pub mod adapters;
pub mod cleaner;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod paging;

// Re-export commonly used types
pub use accounting::UsageAccountant;
pub use cleaner::{CacheCleaner, CleanerConfig};
pub use config::DiskQuotaConfig;
pub use domain::{LayerQuota, Quota, QuotaEvent, StorageUnit};
pub use error::{Error, Result};
pub use metrics::QuotaMetrics;
pub use monitor::DiskQuotaMonitor;
pub use paging::{
    CoarseClock, ExpirationOutcome, ExpirationReport, ExpirationStrategy, PagedExpirationPolicy,
};
