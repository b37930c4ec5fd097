//! Observability infrastructure for rsperm.
//!
//! This module provides:
//! - Prometheus recorder installation and rendering
//! - Structured logging configuration

mod logging;
mod metrics;

pub use logging::init_logging;
pub use metrics::{init_metrics, MetricsError, MetricsState};
