//! Keyed mutexes
//!
//! One mutex per key, created on first use and dropped again once the last
//! guard or waiter for that key is gone. Two keys never contend; the same
//! key is fully serialized. Guards are synchronous and must not be held
//! across an `.await`.

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Map of per-key mutexes, populated on demand
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone + Ord> KeyedLocks<K> {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Block until `key` is held by the caller
    pub fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let guard = self.handle(key).lock_arc();
        KeyGuard {
            table: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Lock several keys, deduplicated and in sorted key order
    ///
    /// Every caller takes keys in the same order, so overlapping sets never
    /// deadlock.
    pub fn lock_many<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> Vec<KeyGuard<'_, K>>
    where
        K: 'a,
    {
        let mut keys: Vec<&K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        keys.into_iter().map(|k| self.lock(k)).collect()
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key is held
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn release(&self, key: &K) {
        // The map's own reference is the only one left when nobody holds or
        // waits for the key. `handle` clones under the same shard lock, so a
        // concurrent waiter always keeps the entry alive.
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl<K: Eq + Hash + Clone + Ord> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> fmt::Debug for KeyedLocks<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("keys", &self.locks.len())
            .finish()
    }
}

/// Exclusive hold on one key; unlocks and evicts the key on drop
pub struct KeyGuard<'a, K: Eq + Hash + Clone + Ord> {
    table: &'a KeyedLocks<K>,
    key: K,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl<K: Eq + Hash + Clone + Ord> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        // Unlock first so the guard's Arc no longer counts
        drop(self.guard.take());
        self.table.release(&self.key);
    }
}

impl<K: Eq + Hash + Clone + Ord + fmt::Debug> fmt::Debug for KeyGuard<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}
