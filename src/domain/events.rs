//! Domain Events
//!
//! Immutable records of significant things the quota engine did: layers
//! coming and going, pages being expired, and enforcement runs finishing.
//!
//! # Example
//!
//! ```ignore
//! let event = QuotaEvent::PageExpired {
//!     layer: "topp:states".to_string(),
//!     gridset_id: "EPSG:4326".to_string(),
//!     page: [3, 1, 7],
//!     tiles_before: 42,
//!     timestamp: Utc::now(),
//! };
//!
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event emitted by the expiration policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QuotaEvent {
    /// A layer was attached to an expiration policy.
    LayerAttached {
        layer: String,
        policy: String,
        gridsets: Vec<String>,
        pages_restored: usize,
        timestamp: DateTime<Utc>,
    },

    /// A layer was detached from an expiration policy.
    LayerDetached {
        layer: String,
        policy: String,
        timestamp: DateTime<Utc>,
    },

    /// A page of tiles was truncated for every format of the layer.
    PageExpired {
        layer: String,
        gridset_id: String,
        /// `[x, y, z]` page index
        page: [u32; 3],
        tiles_before: i64,
        timestamp: DateTime<Utc>,
    },

    /// An enforcement run finished.
    QuotaEnforced {
        layer: String,
        initial_usage_bytes: i64,
        final_usage_bytes: i64,
        pages_expired: usize,
        outcome: String,
        timestamp: DateTime<Utc>,
    },

    /// Page statistics for a gridset couldn't be persisted.
    PageStateSaveFailed {
        layer: String,
        gridset_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl QuotaEvent {
    /// Get the event type as a string.
    pub fn event_type(&self) -> &'static str {
        match self {
            QuotaEvent::LayerAttached { .. } => "LayerAttached",
            QuotaEvent::LayerDetached { .. } => "LayerDetached",
            QuotaEvent::PageExpired { .. } => "PageExpired",
            QuotaEvent::QuotaEnforced { .. } => "QuotaEnforced",
            QuotaEvent::PageStateSaveFailed { .. } => "PageStateSaveFailed",
        }
    }

    /// Layer the event relates to.
    pub fn layer(&self) -> &str {
        match self {
            QuotaEvent::LayerAttached { layer, .. }
            | QuotaEvent::LayerDetached { layer, .. }
            | QuotaEvent::PageExpired { layer, .. }
            | QuotaEvent::QuotaEnforced { layer, .. }
            | QuotaEvent::PageStateSaveFailed { layer, .. } => layer,
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            QuotaEvent::LayerAttached { timestamp, .. }
            | QuotaEvent::LayerDetached { timestamp, .. }
            | QuotaEvent::PageExpired { timestamp, .. }
            | QuotaEvent::QuotaEnforced { timestamp, .. }
            | QuotaEvent::PageStateSaveFailed { timestamp, .. } => *timestamp,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
