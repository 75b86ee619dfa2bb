//! Eventually-consistent key/value map.
//!
//! `EcMap` is the store shared by every cluster member running an
//! orchestrator for the same set of devices. Writes are stamped with a
//! Lamport timestamp `(logical clock, member id)`; replicas converge by
//! applying [`Update`]s with last-writer-wins. Removals leave a tombstone
//! so that an older put arriving late cannot resurrect the key. Tombstones
//! are kept until [`EcMap::compact`] drops those older than a horizon.
//!
//! Like the orchestration maps it replaces, `EcMap` never creates entries
//! implicitly: [`EcMap::update`] fails for a missing key instead of
//! inserting a default.
//!
//! # Example
//!
//! ```
//! use sr_orch_common::EcMap;
//!
//! let local: EcMap<String, u32> = EcMap::new("groups", 1);
//! let peer: EcMap<String, u32> = EcMap::new("groups", 2);
//!
//! local.put("leaf1".to_string(), 7);
//! for update in local.snapshot() {
//!     peer.merge(update);
//! }
//! assert_eq!(peer.get(&"leaf1".to_string()), Some(7));
//! ```

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 1024;

/// Error type for EcMap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EcMapError {
    #[error("Key not found in {0}")]
    KeyNotFound(String),
}

/// Lamport timestamp ordering writes across cluster members.
///
/// Ordered by logical clock first; the member id breaks ties so that two
/// members writing concurrently agree on the winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub logical: u64,
    pub member: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.logical, self.member)
    }
}

/// A replicated write. `value == None` is a removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update<K, V> {
    pub key: K,
    pub value: Option<V>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone)]
struct Versioned<V> {
    value: Option<V>,
    timestamp: Timestamp,
}

/// Eventually-consistent map with last-writer-wins conflict resolution.
pub struct EcMap<K, V> {
    name: String,
    member: u32,
    clock: AtomicU64,
    entries: DashMap<K, Versioned<V>>,
    feed: broadcast::Sender<Update<K, V>>,
}

impl<K, V> EcMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty map owned by cluster member `member`.
    pub fn new(name: impl Into<String>, member: u32) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            name: name.into(),
            member,
            clock: AtomicU64::new(0),
            entries: DashMap::new(),
            feed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member(&self) -> u32 {
        self.member
    }

    fn tick(&self) -> Timestamp {
        Timestamp {
            logical: self.clock.fetch_add(1, Ordering::SeqCst) + 1,
            member: self.member,
        }
    }

    fn publish(&self, key: K, value: Option<V>, timestamp: Timestamp) {
        // No subscribers is the single-member case.
        let _ = self.feed.send(Update {
            key,
            value,
            timestamp,
        });
    }

    /// Returns a copy of the live value for `key`.
    ///
    /// **This never creates entries.**
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).and_then(|e| e.value.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|e| e.value.is_some())
    }

    /// Writes `value` for `key`, returning the previous live value.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let (previous, timestamp) = {
            let mut slot = self.entries.entry(key.clone()).or_insert(Versioned {
                value: None,
                timestamp: Timestamp {
                    logical: 0,
                    member: self.member,
                },
            });
            let timestamp = self.tick();
            let previous = slot.value.replace(value.clone());
            slot.timestamp = timestamp;
            (previous, timestamp)
        };
        self.publish(key, Some(value), timestamp);
        previous
    }

    /// Removes `key`, leaving a tombstone. Returns the removed live value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let (previous, timestamp) = {
            let mut slot = self.entries.get_mut(key)?;
            slot.value.as_ref()?;
            let timestamp = self.tick();
            slot.timestamp = timestamp;
            (slot.value.take(), timestamp)
        };
        self.publish(key.clone(), None, timestamp);
        previous
    }

    /// Applies `f` to the live value for `key` and replicates the result.
    ///
    /// Returns an error if the key is absent or tombstoned.
    pub fn update<F>(&self, key: &K, f: F) -> Result<V, EcMapError>
    where
        F: FnOnce(&mut V),
    {
        let (value, timestamp) = {
            let mut slot = self
                .entries
                .get_mut(key)
                .ok_or_else(|| EcMapError::KeyNotFound(self.name.clone()))?;
            let timestamp = self.tick();
            let value = slot
                .value
                .as_mut()
                .ok_or_else(|| EcMapError::KeyNotFound(self.name.clone()))?;
            f(value);
            let value = value.clone();
            slot.timestamp = timestamp;
            (value, timestamp)
        };
        self.publish(key.clone(), Some(value.clone()), timestamp);
        Ok(value)
    }

    /// Applies a replicated write. Returns true if it won against the
    /// local state.
    pub fn merge(&self, update: Update<K, V>) -> bool {
        self.clock
            .fetch_max(update.timestamp.logical, Ordering::SeqCst);

        match self.entries.entry(update.key) {
            Entry::Occupied(mut slot) => {
                if slot.get().timestamp >= update.timestamp {
                    log::debug!(
                        "{}: dropping stale update {} (local {})",
                        self.name,
                        update.timestamp,
                        slot.get().timestamp
                    );
                    return false;
                }
                slot.insert(Versioned {
                    value: update.value,
                    timestamp: update.timestamp,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Versioned {
                    value: update.value,
                    timestamp: update.timestamp,
                });
            }
        }
        true
    }

    /// Subscribes to local writes, to be shipped to peers and merged there.
    pub fn subscribe(&self) -> broadcast::Receiver<Update<K, V>> {
        self.feed.subscribe()
    }

    /// Full state including tombstones, for anti-entropy with a peer.
    pub fn snapshot(&self) -> Vec<Update<K, V>> {
        self.entries
            .iter()
            .map(|e| Update {
                key: e.key().clone(),
                value: e.value().value.clone(),
                timestamp: e.value().timestamp,
            })
            .collect()
    }

    /// Live key/value pairs.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.entries
            .iter()
            .filter_map(|e| e.value().value.clone().map(|v| (e.key().clone(), v)))
            .collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries
            .iter()
            .filter(|e| e.value().value.is_some())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of removed keys still held as tombstones.
    pub fn tombstones(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().value.is_none())
            .count()
    }

    /// Drops tombstones written more than `horizon` logical ticks before the
    /// current clock. Returns how many were dropped.
    ///
    /// A peer lagging further behind than `horizon` can resurrect a
    /// compacted key with a late put.
    pub fn compact(&self, horizon: u64) -> usize {
        let now = self.clock.load(Ordering::SeqCst);
        let mut dropped = 0;
        self.entries.retain(|_, e| {
            let keep = e.value.is_some() || now.saturating_sub(e.timestamp.logical) <= horizon;
            if !keep {
                dropped += 1;
            }
            keep
        });
        if dropped > 0 {
            log::debug!("{}: compacted {} tombstones", self.name, dropped);
        }
        dropped
    }
}

impl<K, V> fmt::Debug for EcMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcMap")
            .field("name", &self.name)
            .field("member", &self.member)
            .field("clock", &self.clock.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
