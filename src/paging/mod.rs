//! Paged Usage Tracking
//!
//! Splits every gridset of a layer into pages, tracks per-page usage, and
//! evicts whole pages when a layer goes over quota.
//!
//! # Components
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     PagedExpirationPolicy                         │
//! │   attach / detach / save / expire_tiles / expire_tiles_bounded   │
//! │  ┌────────────────────┐     ┌──────────────────────────────────┐ │
//! │  │ PagingStatsCollector│───▶│ TilePageCalculator (per layer)   │ │
//! │  │ (layer listener)    │    │  └─ PagePyramid (per gridset)    │ │
//! │  └────────────────────┘     │       └─ TilePage (per page)     │ │
//! │                             └──────────────────────────────────┘ │
//! │  ExpirationStrategy (LRU / LFU / FIFO / custom)   CoarseClock    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod calculator;
pub mod clock;
pub mod page;
pub mod policy;
pub mod pyramid;
pub mod record;
pub mod strategy;

mod proptest;

pub use calculator::TilePageCalculator;
pub use clock::CoarseClock;
pub use page::{PageIndex, TilePage};
pub use policy::{
    ExpirationOutcome, ExpirationReport, PagedExpirationPolicy, PagingStatsCollector,
    GLOBAL_QUOTA_LABEL,
};
pub use pyramid::{PageLevelInfo, PagePyramid};
pub use strategy::{ExpirationStrategy, PageComparator};
