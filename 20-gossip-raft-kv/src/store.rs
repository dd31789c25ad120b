//! In-memory key-value storage behind the replicated state machine.
//!
//! The FSM is the only writer; HTTP reads go straight to this map and may
//! observe a follower that is behind the leader.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Thread-safe key-value map shared by the FSM and the write gateway.
///
/// A `RwLock` lets concurrent `get`s proceed while the apply loop holds the
/// write side for a single entry at a time, so readers never observe a
/// half-applied command.
///
/// `BTreeMap` keeps iteration deterministic, which makes snapshots
/// byte-for-byte reproducible across nodes.
#[derive(Debug, Default)]
pub struct KvStore {
    data: RwLock<BTreeMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, returning the one it replaced.
    pub fn set(&self, key: String, value: String) -> Option<String> {
        self.write().insert(key, value)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    /// Removes a key, returning the value it held.
    pub fn delete(&self, key: &str) -> Option<String> {
        self.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Clones the entire map.
    ///
    /// Used for snapshots and status output; the lock is released before the
    /// caller iterates.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.read().clone()
    }

    /// Replaces the whole map in one step.
    pub fn replace(&self, data: BTreeMap<String, String>) {
        *self.write() = data;
    }

    // A poisoned lock only means a panic happened while holding it; the map
    // itself is still a valid BTreeMap, so keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
