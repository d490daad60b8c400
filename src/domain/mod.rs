//! Domain Layer
//!
//! Value objects, ports, and events the paging engine is written against.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Quota** (`quota.rs`) - Storage magnitudes and live per-layer usage
//! - **Layer** (`layer.rs`) - Gridset coverage and tile requests
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//! - **Events** (`events.rs`) - Domain events for audit and decoupling

pub mod events;
pub mod layer;
pub mod ports;
pub mod quota;

// Re-export commonly used types
pub use events::QuotaEvent;
pub use layer::{GridSubset, LevelCoverage, StaticTileLayer, TileRequest};
pub use ports::{
    // Port traits
    EventPublisher,
    // Value objects
    GridCoverage,
    PageRecord,
    PageStore,
    TileLayer,
    TileLayerListener,
    TileRange,
    TileTruncator,
};
pub use quota::{LayerQuota, Quota, StorageUnit};
