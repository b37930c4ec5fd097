//! Invalidation events and their priority-tiered batching.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::model::EntityKind;

use super::DecisionCache;

/// Flush tier for an invalidation event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Security-relevant changes such as revocations.
    High,
    #[default]
    Medium,
    /// Bulk or cosmetic changes.
    Low,
}

impl Priority {
    /// Tiers in flush order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// A mutation to a user, role, permission, or tenant that makes dependent
/// cached decisions stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub kind: EntityKind,
    pub entity_id: String,
    pub reason: String,
    #[serde(default)]
    pub priority: Priority,
}

impl InvalidationEvent {
    /// Creates a medium-priority event.
    pub fn new(kind: EntityKind, entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            reason: reason.into(),
            priority: Priority::Medium,
        }
    }

    pub fn user(user_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(EntityKind::User, user_id, reason)
    }

    pub fn role(role_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(EntityKind::Role, role_id, reason)
    }

    /// `permission_key` is the unscoped `action:resource` key.
    pub fn permission(permission_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(EntityKind::Permission, permission_key, reason)
    }

    pub fn tenant(tenant_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(EntityKind::Tenant, tenant_id, reason)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// The cache tag this event invalidates.
    pub fn tag(&self) -> String {
        self.kind.tag(&self.entity_id)
    }
}

/// Pending events, one queue per tier.
#[derive(Debug, Default)]
pub(crate) struct InvalidationQueue {
    tiers: Mutex<[Vec<InvalidationEvent>; 3]>,
}

impl InvalidationQueue {
    pub(crate) fn push(&self, event: InvalidationEvent) {
        self.tiers.lock()[event.priority.index()].push(event);
    }

    pub(crate) fn drain(&self, priority: Priority) -> Vec<InvalidationEvent> {
        std::mem::take(&mut self.tiers.lock()[priority.index()])
    }

    pub(crate) fn len(&self, priority: Priority) -> usize {
        self.tiers.lock()[priority.index()].len()
    }
}

/// Spawns the background task that flushes each tier on its own interval.
///
/// On shutdown every pending tier is flushed before the task exits.
pub fn spawn_flusher(
    cache: Arc<DecisionCache>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = cache.config().clone();
        let mut high = interval(config.high_flush_interval);
        let mut medium = interval(config.medium_flush_interval);
        let mut low = interval(config.low_flush_interval);
        for ticker in [&mut high, &mut medium, &mut low] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        debug!("invalidation flusher started");

        loop {
            tokio::select! {
                _ = high.tick() => {
                    cache.flush(Priority::High).await;
                }
                _ = medium.tick() => {
                    cache.flush(Priority::Medium).await;
                }
                _ = low.tick() => {
                    cache.flush(Priority::Low).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let removed = cache.flush_all().await;
                        info!(removed, "invalidation flusher stopped");
                        break;
                    }
                }
            }
        }
    })
}
