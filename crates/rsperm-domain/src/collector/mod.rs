//! Resolution latency and cache effectiveness aggregation.
//!
//! [`MetricsCollector`] keeps bounded rolling windows of recent resolutions,
//! overall and per action, plus cumulative cache counters shared with the
//! [`DecisionCache`](crate::cache::DecisionCache). Its [`snapshot`](MetricsCollector::snapshot)
//! feeds the adaptive cache controller and is the read-only view handed to
//! external dashboards.
//!
//! Every recording is also forwarded to the `metrics` facade so an installed
//! Prometheus recorder sees the same data.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Default number of samples kept per rolling window.
pub const DEFAULT_WINDOW_SIZE: usize = 1000;

/// Upper bound on distinct actions tracked individually.
pub const MAX_TRACKED_ACTIONS: usize = 256;

/// Cumulative cache counters, shared between the cache and the collector.
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub insertions: AtomicU64,
    pub evictions: AtomicU64,
    pub invalidations: AtomicU64,
    pub corruptions: AtomicU64,
    /// Sets discarded because a tag was invalidated mid-resolution.
    pub stale_writes: AtomicU64,
}

impl CacheCounters {
    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> CacheCountersSnapshot {
        CacheCountersSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
            stale_writes: self.stale_writes.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`CacheCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCountersSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub corruptions: u64,
    pub stale_writes: u64,
}

impl CacheCountersSnapshot {
    /// Evictions per insertion, 0.0 when nothing was inserted.
    pub fn eviction_rate(&self) -> f64 {
        ratio(self.evictions, self.insertions)
    }

    /// Counter deltas since an earlier snapshot.
    pub fn since(&self, earlier: &CacheCountersSnapshot) -> CacheCountersSnapshot {
        CacheCountersSnapshot {
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            insertions: self.insertions.saturating_sub(earlier.insertions),
            evictions: self.evictions.saturating_sub(earlier.evictions),
            invalidations: self.invalidations.saturating_sub(earlier.invalidations),
            corruptions: self.corruptions.saturating_sub(earlier.corruptions),
            stale_writes: self.stale_writes.saturating_sub(earlier.stale_writes),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: Duration,
    cache_hit: bool,
}

/// Fixed-capacity window of the most recent samples.
#[derive(Debug)]
struct RollingWindow {
    samples: VecDeque<Sample>,
    capacity: usize,
    latency_sum: Duration,
    hits: usize,
}

impl RollingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            latency_sum: Duration::ZERO,
            hits: 0,
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.latency_sum = self.latency_sum.saturating_sub(old.latency);
                if old.cache_hit {
                    self.hits -= 1;
                }
            }
        }
        self.latency_sum += sample.latency;
        if sample.cache_hit {
            self.hits += 1;
        }
        self.samples.push_back(sample);
    }

    fn summary(&self) -> WindowSnapshot {
        let count = self.samples.len();
        if count == 0 {
            return WindowSnapshot::default();
        }
        let mut latencies: Vec<Duration> = self.samples.iter().map(|s| s.latency).collect();
        latencies.sort_unstable();
        let p99_index = ((count as f64) * 0.99).ceil() as usize;
        let p99 = latencies[p99_index.clamp(1, count) - 1];

        WindowSnapshot {
            samples: count,
            avg_latency_ms: self.latency_sum.as_secs_f64() * 1000.0 / count as f64,
            p99_latency_ms: p99.as_secs_f64() * 1000.0,
            hit_rate: self.hits as f64 / count as f64,
        }
    }
}

/// Aggregates over one rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub samples: usize,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub hit_rate: f64,
}

/// Read-only view of resolver performance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Average latency over the recent window, in milliseconds.
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Cache hit rate over the recent window.
    pub hit_rate: f64,
    /// Cumulative evictions per insertion.
    pub eviction_rate: f64,
    /// Samples in the recent window.
    pub samples: usize,
    /// Resolutions recorded since startup.
    pub total_resolutions: u64,
    pub breaker_open: bool,
    pub cache: CacheCountersSnapshot,
    pub per_action: BTreeMap<String, WindowSnapshot>,
}

/// Latency and hit-rate aggregation with bounded memory.
#[derive(Debug)]
pub struct MetricsCollector {
    window_size: usize,
    overall: Mutex<RollingWindow>,
    per_action: Mutex<HashMap<String, RollingWindow>>,
    total: AtomicU64,
    breaker_open: AtomicU64,
    cache: Arc<CacheCounters>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl MetricsCollector {
    /// Creates a collector keeping `window_size` samples per window.
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            overall: Mutex::new(RollingWindow::new(window_size)),
            per_action: Mutex::new(HashMap::new()),
            total: AtomicU64::new(0),
            breaker_open: AtomicU64::new(0),
            cache: Arc::new(CacheCounters::default()),
        }
    }

    /// The cache counters this collector reports on.
    pub fn cache_counters(&self) -> Arc<CacheCounters> {
        Arc::clone(&self.cache)
    }

    /// Records one completed resolution.
    pub fn record_resolution(&self, action: &str, duration: Duration, cache_hit: bool) {
        let sample = Sample {
            latency: duration,
            cache_hit,
        };
        self.overall.lock().push(sample);
        {
            let mut per_action = self.per_action.lock();
            if let Some(window) = per_action.get_mut(action) {
                window.push(sample);
            } else if per_action.len() < MAX_TRACKED_ACTIONS {
                let mut window = RollingWindow::new(self.window_size);
                window.push(sample);
                per_action.insert(action.to_string(), window);
            }
        }
        self.total.fetch_add(1, Ordering::Relaxed);

        let cached = if cache_hit { "true" } else { "false" };
        metrics::histogram!("rsperm_resolve_duration_seconds", "cached" => cached)
            .record(duration.as_secs_f64());
    }

    /// Records the circuit breaker's state.
    pub fn record_breaker_state(&self, open: bool) {
        self.breaker_open.store(u64::from(open), Ordering::Relaxed);
        metrics::gauge!("rsperm_breaker_open").set(if open { 1.0 } else { 0.0 });
    }

    /// Returns aggregates over the recent windows and cumulative counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let overall = self.overall.lock().summary();
        let per_action = self
            .per_action
            .lock()
            .iter()
            .map(|(action, window)| (action.clone(), window.summary()))
            .collect();
        let cache = self.cache.snapshot();

        MetricsSnapshot {
            avg_latency_ms: overall.avg_latency_ms,
            p99_latency_ms: overall.p99_latency_ms,
            hit_rate: overall.hit_rate,
            eviction_rate: cache.eviction_rate(),
            samples: overall.samples,
            total_resolutions: self.total.load(Ordering::Relaxed),
            breaker_open: self.breaker_open.load(Ordering::Relaxed) == 1,
            cache,
            per_action,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Registers metric descriptions with the installed recorder.
///
/// Optional; call once at startup for better Prometheus documentation.
pub fn register_resolver_metrics() {
    metrics::describe_counter!(
        "rsperm_resolve_total",
        "Total number of permission resolutions by outcome"
    );
    metrics::describe_histogram!(
        "rsperm_resolve_duration_seconds",
        "Permission resolution duration in seconds"
    );
    metrics::describe_counter!("rsperm_cache_hits_total", "Total number of decision cache hits");
    metrics::describe_counter!(
        "rsperm_cache_misses_total",
        "Total number of decision cache misses"
    );
    metrics::describe_counter!(
        "rsperm_cache_invalidations_total",
        "Total number of cache entries removed by tag invalidation"
    );
    metrics::describe_counter!(
        "rsperm_cache_evictions_total",
        "Total number of cache entries evicted under capacity pressure"
    );
    metrics::describe_counter!(
        "rsperm_cache_corruption_total",
        "Total number of orphaned cache entries dropped"
    );
    metrics::describe_gauge!("rsperm_breaker_open", "1 when the backing store breaker is open");
    metrics::describe_counter!(
        "rsperm_audit_failures_total",
        "Total number of decisions the audit sink failed to accept"
    );
}
