//! Quota Metrics
//!
//! Prometheus counters for enforcement activity. Each instance owns its own
//! registry so several policies (and tests) never collide on registration.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::Result;

/// Prometheus metrics recorded by the expiration policy
#[derive(Debug, Clone)]
pub struct QuotaMetrics {
    registry: Registry,
    pages_expired: IntCounterVec,
    truncations: IntCounterVec,
    enforcement_runs: IntCounterVec,
    enforcement_failures: IntCounterVec,
    attached_layers: IntGauge,
}

impl QuotaMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let pages_expired = IntCounterVec::new(
            Opts::new("tilequota_pages_expired_total", "Pages truncated to enforce quotas"),
            &["layer"],
        )?;
        let truncations = IntCounterVec::new(
            Opts::new(
                "tilequota_truncations_total",
                "Truncation requests handed to the tile store",
            ),
            &["layer"],
        )?;
        let enforcement_runs = IntCounterVec::new(
            Opts::new(
                "tilequota_enforcement_runs_total",
                "Completed quota enforcement runs by outcome",
            ),
            &["layer", "outcome"],
        )?;
        let enforcement_failures = IntCounterVec::new(
            Opts::new(
                "tilequota_enforcement_failures_total",
                "Quota enforcement runs aborted by an error",
            ),
            &["layer"],
        )?;
        let attached_layers = IntGauge::new(
            "tilequota_attached_layers",
            "Layers attached to the expiration policy",
        )?;

        registry.register(Box::new(pages_expired.clone()))?;
        registry.register(Box::new(truncations.clone()))?;
        registry.register(Box::new(enforcement_runs.clone()))?;
        registry.register(Box::new(enforcement_failures.clone()))?;
        registry.register(Box::new(attached_layers.clone()))?;

        Ok(Self {
            registry,
            pages_expired,
            truncations,
            enforcement_runs,
            enforcement_failures,
            attached_layers,
        })
    }

    pub fn record_page_expired(&self, layer: &str) {
        self.pages_expired.with_label_values(&[layer]).inc();
    }

    pub fn record_truncation(&self, layer: &str) {
        self.truncations.with_label_values(&[layer]).inc();
    }

    pub fn record_run(&self, layer: &str, outcome: &str) {
        self.enforcement_runs
            .with_label_values(&[layer, outcome])
            .inc();
    }

    pub fn record_failure(&self, layer: &str) {
        self.enforcement_failures.with_label_values(&[layer]).inc();
    }

    pub fn set_attached_layers(&self, count: usize) {
        self.attached_layers.set(count as i64);
    }

    pub fn pages_expired(&self, layer: &str) -> u64 {
        self.pages_expired.with_label_values(&[layer]).get()
    }

    pub fn truncations(&self, layer: &str) -> u64 {
        self.truncations.with_label_values(&[layer]).get()
    }

    pub fn enforcement_runs(&self, layer: &str, outcome: &str) -> u64 {
        self.enforcement_runs
            .with_label_values(&[layer, outcome])
            .get()
    }

    pub fn enforcement_failures(&self, layer: &str) -> u64 {
        self.enforcement_failures.with_label_values(&[layer]).get()
    }

    pub fn attached_layers(&self) -> i64 {
        self.attached_layers.get()
    }

    /// Underlying registry, for embedding in a wider exporter
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = QuotaMetrics::new().unwrap();
        metrics.record_page_expired("roads");
        metrics.record_page_expired("roads");
        metrics.record_truncation("roads");
        metrics.record_run("roads", "QuotaReached");
        metrics.record_failure("rivers");
        metrics.set_attached_layers(2);

        assert_eq!(metrics.pages_expired("roads"), 2);
        assert_eq!(metrics.truncations("roads"), 1);
        assert_eq!(metrics.enforcement_runs("roads", "QuotaReached"), 1);
        assert_eq!(metrics.enforcement_runs("roads", "Stalled"), 0);
        assert_eq!(metrics.enforcement_failures("rivers"), 1);
        assert_eq!(metrics.attached_layers(), 2);
    }

    #[test]
    fn test_gather_text() {
        let metrics = QuotaMetrics::new().unwrap();
        metrics.record_page_expired("roads");
        let text = metrics.gather_text().unwrap();
        assert!(text.contains("tilequota_pages_expired_total{layer=\"roads\"} 1"));
        assert!(text.contains("tilequota_attached_layers 0"));
    }

    #[test]
    fn test_independent_registries() {
        let a = QuotaMetrics::new().unwrap();
        let b = QuotaMetrics::new().unwrap();
        a.record_truncation("roads");
        assert_eq!(b.truncations("roads"), 0);
    }
}
