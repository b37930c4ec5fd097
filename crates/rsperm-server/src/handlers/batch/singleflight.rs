//! Singleflight for deduplicating concurrent resolutions of the same check.

use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Result of trying to acquire a singleflight slot.
pub enum SingleflightSlot<V> {
    /// We won the race and should execute the operation.
    /// Contains the sender to broadcast results.
    Leader(broadcast::Sender<V>),
    /// Another task is executing; wait for its result.
    Follower(broadcast::Receiver<V>),
}

/// When several callers ask for the same key concurrently, only one executes
/// and the rest share its result.
pub struct Singleflight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    in_flight: DashMap<K, broadcast::Sender<V>>,
}

impl<K, V> Singleflight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// Atomically try to acquire a slot for this key.
    ///
    /// Returns `Leader` if this caller should execute the operation, or
    /// `Follower` if another caller already is. The check-and-insert uses the
    /// entry API so two callers can never both lead.
    pub fn acquire(&self, key: K) -> SingleflightSlot<V> {
        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => SingleflightSlot::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                SingleflightSlot::Leader(tx)
            }
        }
    }

    /// Remove a completed in-flight operation.
    pub fn complete(&self, key: &K) {
        self.in_flight.remove(key);
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl<K, V> Default for Singleflight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that ensures singleflight cleanup on drop.
///
/// Followers of a leader that panicked or was cancelled see the channel
/// close and retry on their own.
pub struct SingleflightGuard<'a, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    singleflight: &'a Singleflight<K, V>,
    key: K,
    completed: bool,
}

impl<'a, K, V> SingleflightGuard<'a, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(singleflight: &'a Singleflight<K, V>, key: K) -> Self {
        Self {
            singleflight,
            key,
            completed: false,
        }
    }

    /// Mark as completed (normal path).
    pub fn complete(mut self) {
        self.singleflight.complete(&self.key);
        self.completed = true;
    }
}

impl<K, V> Drop for SingleflightGuard<'_, K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            self.singleflight.complete(&self.key);
        }
    }
}
