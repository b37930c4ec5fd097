//! Tenant/entity boundary enforcement.
//!
//! Membership answers are cached in their own short-TTL cache keyed by
//! `(user_id, entity_id)`, separate from the decision cache. Only successful
//! lookups are cached; a failed or timed-out lookup is never treated as
//! membership.
//!
//! Every invalidation bumps a generation counter. A lookup caches its answer
//! only if no invalidation ran while it was in flight, so a membership
//! removed mid-lookup is never written back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{DomainError, DomainResult};
use crate::model::ResolveContext;
use crate::resolver::MembershipLookup;

/// Configuration for the boundary validator.
#[derive(Debug, Clone)]
pub struct BoundaryConfig {
    pub membership_ttl: Duration,
    pub capacity: u64,
    pub lookup_timeout: Duration,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            membership_ttl: Duration::from_secs(30),
            capacity: 10_000,
            lookup_timeout: Duration::from_millis(50),
        }
    }
}

impl BoundaryConfig {
    pub fn with_membership_ttl(mut self, ttl: Duration) -> Self {
        self.membership_ttl = ttl;
        self
    }

    pub fn with_lookup_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }
}

/// Result of a single membership check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryOutcome {
    Member,
    NotMember,
    LookupFailed(String),
}

/// Checks that a principal belongs to every tenant/entity in a context.
pub struct EntityBoundaryValidator<L> {
    lookup: Arc<L>,
    memberships: Cache<(String, String), bool>,
    generation: AtomicU64,
    config: BoundaryConfig,
}

impl<L: MembershipLookup> EntityBoundaryValidator<L> {
    pub fn new(lookup: Arc<L>, config: BoundaryConfig) -> Self {
        let memberships = Cache::builder()
            .max_capacity(config.capacity)
            .time_to_live(config.membership_ttl)
            .support_invalidation_closures()
            .build();
        Self {
            lookup,
            memberships,
            generation: AtomicU64::new(0),
            config,
        }
    }

    /// Whether the user is a member of every boundary in `context`.
    ///
    /// A context without tenant or entity is trivially valid. Lookup
    /// failures return `false`.
    pub async fn validate(&self, user_id: &str, context: &ResolveContext) -> bool {
        self.enforce(user_id, context).await.is_ok()
    }

    /// Like [`validate`](Self::validate) but distinguishes a real violation
    /// from a failed lookup.
    pub async fn enforce(&self, user_id: &str, context: &ResolveContext) -> DomainResult<()> {
        for entity_id in context.boundary_ids() {
            match self.check(user_id, entity_id).await {
                BoundaryOutcome::Member => {}
                BoundaryOutcome::NotMember => {
                    return Err(DomainError::BoundaryViolation {
                        user_id: user_id.to_string(),
                        entity_id: entity_id.to_string(),
                    })
                }
                BoundaryOutcome::LookupFailed(message) => {
                    return Err(DomainError::store_unavailable(message))
                }
            }
        }
        Ok(())
    }

    /// Membership of one user in one entity.
    pub async fn check(&self, user_id: &str, entity_id: &str) -> BoundaryOutcome {
        let key = (user_id.to_string(), entity_id.to_string());
        if let Some(member) = self.memberships.get(&key).await {
            return outcome(member);
        }

        let generation = self.generation.load(Ordering::Acquire);
        match timeout(
            self.config.lookup_timeout,
            self.lookup.is_member(user_id, entity_id),
        )
        .await
        {
            Ok(Ok(member)) => {
                self.remember(key, member, generation).await;
                outcome(member)
            }
            Ok(Err(err)) => {
                warn!(user_id, entity_id, error = %err, "membership lookup failed");
                BoundaryOutcome::LookupFailed(err.to_string())
            }
            Err(_) => {
                warn!(
                    user_id,
                    entity_id,
                    timeout_ms = self.config.lookup_timeout.as_millis() as u64,
                    "membership lookup timed out"
                );
                BoundaryOutcome::LookupFailed("membership lookup timed out".to_string())
            }
        }
    }

    async fn remember(&self, key: (String, String), member: bool, generation: u64) {
        if self.generation.load(Ordering::Acquire) != generation {
            debug!(
                user_id = %key.0,
                entity_id = %key.1,
                "membership changed during lookup, not caching"
            );
            return;
        }
        self.memberships.insert(key.clone(), member).await;
        // An invalidation that began during the insert may have missed it.
        if self.generation.load(Ordering::Acquire) != generation {
            self.memberships.invalidate(&key).await;
        }
    }

    /// Forgets cached memberships of one user.
    pub fn invalidate_user(&self, user_id: &str) {
        let user_id = user_id.to_string();
        self.invalidate_where(move |(user, _)| *user == user_id);
    }

    /// Forgets cached memberships in one tenant or entity.
    pub fn invalidate_entity(&self, entity_id: &str) {
        let entity_id = entity_id.to_string();
        self.invalidate_where(move |(_, entity)| *entity == entity_id);
    }

    fn invalidate_where<F>(&self, predicate: F)
    where
        F: Fn(&(String, String)) -> bool + Send + Sync + 'static,
    {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self
            .memberships
            .invalidate_entries_if(move |key, _| predicate(key))
        {
            warn!(error = %err, "membership invalidation predicate rejected, clearing all");
            self.memberships.invalidate_all();
        } else {
            debug!("membership cache entries invalidated");
        }
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.memberships.invalidate_all();
    }
}

fn outcome(member: bool) -> BoundaryOutcome {
    if member {
        BoundaryOutcome::Member
    } else {
        BoundaryOutcome::NotMember
    }
}
