//! Circuit breaker around the backing store.
//!
//! After `failure_threshold` consecutive failures within `failure_window` the
//! breaker opens and calls fail fast. Once `cooldown` has elapsed a single
//! probe is let through (half-open); its success closes the breaker, its
//! failure re-opens it for another cooldown. A probe whose caller goes away
//! before it reports back counts as failed.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Failures further apart than this do not accumulate.
    pub failure_window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            cooldown: Duration::from_secs(5),
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() != BreakerState::Closed
    }

    /// Whether a request may reach the backing store.
    ///
    /// When the cooldown has elapsed the first caller becomes the half-open
    /// probe; everyone else keeps failing fast until it reports back.
    pub fn allow_request(&self) -> bool {
        self.enter().is_some()
    }

    /// Admits one call, or `None` while the breaker is open.
    ///
    /// The returned [`BreakerCall`] must be finished with the call's outcome.
    /// Dropping it unfinished releases a half-open probe as a failure.
    pub fn admit(&self) -> Option<BreakerCall<'_>> {
        self.enter().map(|probe| BreakerCall {
            breaker: self,
            probe,
            finished: false,
        })
    }

    /// `Some(true)` when the caller becomes the half-open probe.
    fn enter(&self) -> Option<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Some(false),
            BreakerState::HalfOpen => None,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown);
                if cooled && !inner.probe_in_flight {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("circuit breaker half-open, probing backing store");
                    Some(true)
                } else {
                    None
                }
            }
        }
    }

    fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen && inner.probe_in_flight {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            warn!("circuit breaker probe abandoned, re-opening");
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.first_failure_at = None;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            info!("circuit breaker closed, backing store recovered");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                warn!("circuit breaker probe failed, re-opening");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                let in_window = inner
                    .first_failure_at
                    .is_some_and(|first| now.duration_since(first) <= self.config.failure_window);
                if in_window {
                    inner.consecutive_failures += 1;
                } else {
                    inner.consecutive_failures = 1;
                    inner.first_failure_at = Some(now);
                }
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        failures = inner.consecutive_failures,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "circuit breaker opened, backing store failing"
                    );
                }
            }
        }
    }
}

/// One admitted backing-store call.
#[must_use = "finish the call with its outcome"]
#[derive(Debug)]
pub struct BreakerCall<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    finished: bool,
}

impl BreakerCall<'_> {
    pub fn finish(mut self, success: bool) {
        self.finished = true;
        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
    }
}

impl Drop for BreakerCall<'_> {
    fn drop(&mut self) {
        if self.probe && !self.finished {
            self.breaker.abandon_probe();
        }
    }
}
