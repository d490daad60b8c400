//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  PageStore │ UsageStore │ EventPublisher │ TileTruncator    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │  FilePageStore │ InMemoryPageStore                          │ │
//! │  │  LoggingEventPublisher │ InMemoryEventCollector             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The truncation port has no adapter here: deleting tiles belongs to the
//! storage backend embedding this crate.
//!
//! # Usage
//!
//! ```ignore
//! use tilequota::adapters::{FilePageStore, LoggingEventPublisher};
//! use tilequota::paging::{ExpirationStrategy, PagedExpirationPolicy};
//!
//! let policy = PagedExpirationPolicy::new(
//!     ExpirationStrategy::LeastRecentlyUsed,
//!     truncator,
//!     Arc::new(FilePageStore::new("/var/cache/tiles/diskquota")),
//! )
//! .with_event_publisher(Arc::new(LoggingEventPublisher::info_level()));
//! ```

mod event_publisher;
mod file_page_store;
mod memory_page_store;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use file_page_store::{sanitize_name, FilePageStore, PAGE_FILE_EXTENSION, USAGE_FILE_NAME};
pub use memory_page_store::InMemoryPageStore;
