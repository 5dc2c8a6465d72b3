//! Second-tier and stale-tier storage.
//!
//! `ExternalStore` is the contract the output cache uses for every tier beyond
//! the primary one. `MemoryStore` is the in-process implementation.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::Duration;

use lru::LruCache;
use time::OffsetDateTime;

use super::entry::TimedEntry;
use super::error::StoreError;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// A key/value store holding timed entries, possibly out of process.
///
/// Reads must return the entry as it was written, including its original
/// creation time and TTL, so the caller can compute the remaining lifetime.
pub trait ExternalStore<K, V>: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    fn get(&self, key: &K) -> Result<Option<TimedEntry<K, V>>, StoreError>;

    fn put(&self, entry: TimedEntry<K, V>) -> Result<(), StoreError>;

    /// Returns whether an entry was removed.
    fn remove(&self, key: &K) -> Result<bool, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

/// In-process LRU store.
///
/// Entries are kept regardless of their own TTL; the output cache decides
/// what an expired entry means. `retention` optionally drops entries older
/// than the given age on read, which is how a stale tier bounds how old a
/// last-resort value may be.
pub struct MemoryStore<K: Hash + Eq, V> {
    name: &'static str,
    retention: Option<Duration>,
    entries: RwLock<LruCache<K, TimedEntry<K, V>>>,
}

impl<K: Hash + Eq, V> MemoryStore<K, V> {
    pub fn new(name: &'static str, capacity: NonZeroUsize) -> Self {
        Self {
            name,
            retention: None,
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Get the number of stored entries.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn outlived_retention(&self, entry: &TimedEntry<K, V>, now: OffsetDateTime) -> bool {
        match self.retention {
            Some(retention) => {
                let age: Duration = (now - entry.created_at())
                    .try_into()
                    .unwrap_or(Duration::ZERO);
                age >= retention
            }
            None => false,
        }
    }
}

impl<K, V> ExternalStore<K, V> for MemoryStore<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn get(&self, key: &K) -> Result<Option<TimedEntry<K, V>>, StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let outlived = match entries.get(key) {
            Some(entry) => self.outlived_retention(entry, OffsetDateTime::now_utc()),
            None => return Ok(None),
        };
        if outlived {
            entries.pop(key);
            return Ok(None);
        }
        Ok(entries.get(key).cloned())
    }

    fn put(&self, entry: TimedEntry<K, V>) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "put").put(entry.key().clone(), entry);
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<bool, StoreError> {
        Ok(rw_write(&self.entries, SOURCE, "remove").pop(key).is_some())
    }

    fn clear(&self) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "clear").clear();
        Ok(())
    }
}
