//! Prometheus metrics infrastructure.
//!
//! The domain crate emits through the `metrics` facade; this module installs
//! the Prometheus recorder behind it and renders the exposition text for an
//! external scraper.
//!
//! # Metrics Exposed
//!
//! - `rsperm_resolve_total` - Resolutions by outcome, reason and cache status
//! - `rsperm_resolve_duration_seconds` - Resolution duration histogram
//! - `rsperm_cache_hits_total` / `rsperm_cache_misses_total` - Decision cache lookups
//! - `rsperm_cache_invalidations_total` - Entries removed by tag invalidation
//! - `rsperm_cache_evictions_total` - Entries evicted under capacity pressure
//! - `rsperm_cache_corruption_total` - Orphaned entries dropped
//! - `rsperm_breaker_open` - 1 while the backing store breaker is open
//! - `rsperm_audit_failures_total` - Decisions the audit sink rejected
//! - `rsperm_batch_requests_total` / `rsperm_batch_dedup_ratio` - Batch handler

use std::sync::Arc;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Shared handle for rendering metrics.
#[derive(Clone)]
pub struct MetricsState {
    handle: Arc<PrometheusHandle>,
}

impl MetricsState {
    pub fn new(handle: PrometheusHandle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Renders the current metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Error type for metrics initialization.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install Prometheus recorder: recorder already installed")]
    AlreadyInstalled,
}

/// Installs the Prometheus recorder as the global `metrics` recorder.
///
/// Call once at startup, before any metric is recorded.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics() -> Result<MetricsState, MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|_| MetricsError::AlreadyInstalled)?;

    register_default_metrics();

    Ok(MetricsState::new(handle))
}

fn register_default_metrics() {
    rsperm_domain::collector::register_resolver_metrics();

    metrics::describe_counter!(
        "rsperm_batch_requests_total",
        "Total number of batch resolve requests"
    );
    metrics::describe_histogram!(
        "rsperm_batch_dedup_ratio",
        "Fraction of checks in a batch removed by deduplication"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only one recorder can be installed per process; these tests use
    // unregistered recorders. Installation is covered by the service tests.

    #[test]
    fn test_metrics_state_can_be_cloned() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let state = MetricsState::new(handle);
        let _cloned = state.clone();
    }

    #[test]
    fn test_render_includes_recorded_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let state = MetricsState::new(recorder.handle());

        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("rsperm_resolve_total", "outcome" => "granted").increment(3);
        });

        let output = state.render();
        assert!(output.contains("rsperm_resolve_total"));
        assert!(output.contains("outcome=\"granted\""));
    }
}
