//! Per-key mutual exclusion.
//!
//! Chain splices and membership/grant transitions read a row, decide, then
//! write one or more rows. Holding the key's guard across that sequence keeps
//! two callers in this process from interleaving on the same chain or the
//! same (scope, user). Separate processes sharing one store file are not
//! covered.

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::hash::Hash;
use std::sync::Arc;

type Slot = Arc<Mutex<()>>;

/// Guard returned by [`KeyedLocks::lock`].
///
/// Dropping it releases the key and removes the key's slot from the map when
/// no other caller is holding or waiting on it, so the map only ever holds
/// keys that are in use.
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct KeyGuard<'a, K: Eq + Hash> {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    locks: &'a DashMap<K, Slot>,
    key: Option<K>,
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        // Unlock first so our own Arc no longer counts.
        drop(self.guard.take());
        if let Some(key) = self.key.take() {
            // Slots are only cloned under the shard lock, so a count of one
            // here means nobody else can reach this slot.
            self.locks
                .remove_if(&key, |_, slot| Arc::strong_count(slot) == 1);
        }
    }
}

impl<K: Eq + Hash> std::fmt::Debug for KeyGuard<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").finish_non_exhaustive()
    }
}

pub struct KeyedLocks<K> {
    locks: DashMap<K, Slot>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Block until the section for `key` is free.
    pub fn lock(&self, key: K) -> KeyGuard<'_, K> {
        // Clone the Arc out so the shard lock is released before blocking.
        let slot = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        KeyGuard {
            guard: Some(slot.lock_arc()),
            locks: &self.locks,
            key: Some(key),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for KeyedLocks<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLocks").finish_non_exhaustive()
    }
}
