//! In-memory implementation of [`KeyValueClient`].
//!
//! [`InMemoryKeyValueStore`] keeps entries in a [`DashMap`]; each call
//! locks only the shard of the key it touches, which makes
//! `compare_and_set` atomic per key. Call statistics let tests observe how
//! the dialect talks to the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use gridstore_core::GridError;

use crate::client::{KeyValueClient, Version, Versioned};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    version: Version,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Counts of the calls made against an [`InMemoryKeyValueStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvCallStats {
    pub gets: usize,
    pub puts: usize,
    pub compare_and_sets: usize,
    /// `compare_and_set` calls that found a different version.
    pub conflicts: usize,
    pub deletes: usize,
}

impl KvCallStats {
    /// Number of calls that could have written.
    pub fn writes(&self) -> usize {
        self.puts + self.compare_and_sets + self.deletes
    }
}

/// Key-value store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: DashMap<String, StoredValue>,
    last_version: AtomicU64,
    stats: Mutex<KvCallStats>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        InMemoryKeyValueStore::default()
    }

    pub fn stats(&self) -> KvCallStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = KvCallStats::default();
    }

    /// Live value of `key` without recording a call.
    pub fn value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drops expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }

    fn record(&self, f: impl FnOnce(&mut KvCallStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn stored(&self, value: &str, ttl: Option<Duration>) -> StoredValue {
        StoredValue {
            value: value.to_string(),
            version: self.last_version.fetch_add(1, Ordering::SeqCst) + 1,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }
}

impl KeyValueClient for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, GridError> {
        self.record(|s| s.gets += 1);
        let now = Instant::now();
        Ok(self.entries.get(key).filter(|entry| entry.is_live(now)).map(|entry| Versioned {
            value: entry.value.clone(),
            version: entry.version,
        }))
    }

    fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Version, GridError> {
        self.record(|s| s.puts += 1);
        let stored = self.stored(value, ttl);
        let version = stored.version;
        self.entries.insert(key.to_string(), stored);
        Ok(version)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Version>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, GridError> {
        self.record(|s| s.compare_and_sets += 1);
        let now = Instant::now();
        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get()).filter(|e| e.is_live(now)).map(|e| e.version);
                if current == expected {
                    occupied.insert(self.stored(value, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(self.stored(value, ttl));
                    true
                } else {
                    false
                }
            }
        };
        if !swapped {
            self.record(|s| s.conflicts += 1);
        }
        Ok(swapped)
    }

    fn delete(&self, key: &str) -> Result<bool, GridError> {
        self.record(|s| s.deletes += 1);
        let now = Instant::now();
        Ok(self.entries.remove(key).is_some_and(|(_, entry)| entry.is_live(now)))
    }
}
