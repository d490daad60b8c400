//! Event Publisher Adapters
//!
//! `LoggingEventPublisher` turns quota events into an eviction audit trail
//! on the tracing system. `InMemoryEventCollector` keeps them for
//! inspection.
//!
//! | Event                              | Level               |
//! |------------------------------------|---------------------|
//! | `PageStateSaveFailed`              | warn                |
//! | `QuotaEnforced` ending `Stalled`   | warn                |
//! | everything else                    | configured (info)   |

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::events::QuotaEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Publishes quota events to the log
#[derive(Debug, Clone)]
pub struct LoggingEventPublisher {
    /// Routine events at info (true) or debug (false)
    verbose: bool,
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self::info_level()
    }
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_level() -> Self {
        Self { verbose: true }
    }

    pub fn debug_level() -> Self {
        Self { verbose: false }
    }

    /// Whether `event` signals that quota enforcement needs attention
    pub fn needs_attention(event: &QuotaEvent) -> bool {
        match event {
            QuotaEvent::PageStateSaveFailed { .. } => true,
            QuotaEvent::QuotaEnforced { outcome, .. } => outcome == "Stalled",
            _ => false,
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: QuotaEvent) -> Result<()> {
        let event_type = event.event_type();
        let layer = event.layer();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if Self::needs_attention(&event) {
            warn!(event_type, layer = %layer, event = %json, "Quota event");
        } else if self.verbose {
            info!(event_type, layer = %layer, event = %json, "Quota event");
        } else {
            debug!(event_type, layer = %layer, event = %json, "Quota event");
        }
        Ok(())
    }
}

/// Keeps every published event in memory
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<QuotaEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<QuotaEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose `event_type()` is `event_type`
    pub fn events_of_type(&self, event_type: &str) -> Vec<QuotaEvent> {
        self.matching(|e| e.event_type() == event_type)
    }

    /// Events concerning one layer
    pub fn events_for_layer(&self, layer: &str) -> Vec<QuotaEvent> {
        self.matching(|e| e.layer() == layer)
    }

    fn matching(&self, keep: impl Fn(&QuotaEvent) -> bool) -> Vec<QuotaEvent> {
        self.events.read().iter().filter(|e| keep(e)).cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: QuotaEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
