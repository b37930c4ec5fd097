//! Hit-rate driven cache warming and capacity signals.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::collector::{CacheCountersSnapshot, MetricsSnapshot};

/// Configuration for the adaptive controller.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    /// Hit rate below which warming is triggered.
    pub target_hit_rate: f64,
    /// Minimum window samples before the hit rate is trusted.
    pub min_samples: usize,
    pub evaluation_interval: Duration,
    /// Maximum keys re-resolved per warming cycle.
    pub warm_batch_size: usize,
    /// Per-cycle evictions/insertions above which capacity is flagged.
    pub eviction_rate_threshold: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_hit_rate: 0.95,
            min_samples: 50,
            evaluation_interval: Duration::from_secs(30),
            warm_batch_size: 64,
            eviction_rate_threshold: 0.2,
        }
    }
}

impl AdaptiveConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_target_hit_rate(mut self, target: f64) -> Self {
        self.target_hit_rate = target;
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    pub fn with_warm_batch_size(mut self, size: usize) -> Self {
        self.warm_batch_size = size;
        self
    }

    pub fn with_evaluation_interval(mut self, interval: Duration) -> Self {
        self.evaluation_interval = interval;
        self
    }
}

/// Operational signal that the cache is undersized. Never acted on automatically.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapacityRecommendation {
    pub current: u64,
    pub suggested: u64,
    pub eviction_rate: f64,
}

/// What one controller cycle decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ControllerAction {
    /// Warm the hottest absent keys.
    pub warm: bool,
    pub capacity: Option<CapacityRecommendation>,
}

/// Compares recent hit rate with the target and decides whether to warm.
#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    previous: Mutex<CacheCountersSnapshot>,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            previous: Mutex::new(CacheCountersSnapshot::default()),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Evaluates one cycle.
    ///
    /// The eviction rate is measured over the counters accumulated since the
    /// previous call, so a burst long ago does not keep flagging capacity.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot, capacity: u64) -> ControllerAction {
        let cycle = {
            let mut previous = self.previous.lock();
            let delta = snapshot.cache.since(&previous);
            *previous = snapshot.cache;
            delta
        };

        if !self.config.enabled || snapshot.samples < self.config.min_samples {
            return ControllerAction::default();
        }
        if snapshot.hit_rate >= self.config.target_hit_rate {
            return ControllerAction::default();
        }

        let eviction_rate = cycle.eviction_rate();
        debug!(
            hit_rate = snapshot.hit_rate,
            target = self.config.target_hit_rate,
            eviction_rate,
            "hit rate below target, warming cache"
        );

        let capacity = (eviction_rate > self.config.eviction_rate_threshold).then(|| {
            let recommendation = CapacityRecommendation {
                current: capacity,
                suggested: capacity.saturating_mul(2),
                eviction_rate,
            };
            warn!(
                current = recommendation.current,
                suggested = recommendation.suggested,
                eviction_rate,
                "decision cache is evicting under pressure, consider raising capacity"
            );
            recommendation
        });

        ControllerAction {
            warm: true,
            capacity,
        }
    }
}
