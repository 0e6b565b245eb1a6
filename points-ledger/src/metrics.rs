//! Metrics collection for observability
//!
//! Prometheus metrics for the ledger, held in a per-instance registry.
//!
//! # Metrics
//!
//! - `points_entries_created_total` - Ledger entries created
//! - `points_entries_updated_total` - Ledger entries updated
//! - `points_entries_deleted_total` - Ledger entries deleted
//! - `points_batch_members_skipped_total` - Batch members skipped
//! - `points_audit_write_failures_total` - Audit appends that failed
//! - `points_audit_rows_purged_total` - Audit rows removed by retention
//! - `points_command_duration_seconds` - Histogram of admin command latencies

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Entries created
    pub entries_created: IntCounter,

    /// Entries updated
    pub entries_updated: IntCounter,

    /// Entries deleted
    pub entries_deleted: IntCounter,

    /// Batch members skipped
    pub batch_skipped: IntCounter,

    /// Audit append failures
    pub audit_failures: IntCounter,

    /// Audit rows purged
    pub audit_purged: IntCounter,

    /// Command duration histogram
    pub command_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_created = counter(
            &registry,
            "points_entries_created_total",
            "Total number of ledger entries created",
        )?;
        let entries_updated = counter(
            &registry,
            "points_entries_updated_total",
            "Total number of ledger entries updated",
        )?;
        let entries_deleted = counter(
            &registry,
            "points_entries_deleted_total",
            "Total number of ledger entries deleted",
        )?;
        let batch_skipped = counter(
            &registry,
            "points_batch_members_skipped_total",
            "Batch adjustment members skipped",
        )?;
        let audit_failures = counter(
            &registry,
            "points_audit_write_failures_total",
            "Audit log appends that failed",
        )?;
        let audit_purged = counter(
            &registry,
            "points_audit_rows_purged_total",
            "Audit log rows removed by the retention sweep",
        )?;

        let command_duration = Histogram::with_opts(
            HistogramOpts::new(
                "points_command_duration_seconds",
                "Histogram of admin command latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        Ok(Self {
            entries_created,
            entries_updated,
            entries_deleted,
            batch_skipped,
            audit_failures,
            audit_purged,
            command_duration,
            registry,
        })
    }

    /// Record command duration
    pub fn record_command_duration(&self, duration_seconds: f64) {
        self.command_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_created", &self.entries_created.get())
            .field("audit_failures", &self.audit_failures.get())
            .finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.entries_created.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.entries_created.inc();
        assert_eq!(a.entries_created.get(), 1);
        assert_eq!(b.entries_created.get(), 0);
    }

    #[test]
    fn test_render() {
        let metrics = Metrics::new().unwrap();
        metrics.batch_skipped.inc();
        metrics.record_command_duration(0.002);

        let text = metrics.render();
        assert!(text.contains("points_batch_members_skipped_total 1"));
        assert!(text.contains("points_command_duration_seconds_count 1"));
    }
}
