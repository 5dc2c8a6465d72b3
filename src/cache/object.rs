//! Event-driven object cache.
//!
//! Holds values only as long as callers keep them alive, and drops them
//! early when one of the events they were stored under fires.
//!
//! The cache never owns a strong handle to a value. `put` hands the only
//! [`Arc<Cached<V>>`] back to the caller; once the last clone is dropped, the
//! entry is reclaimed on the next access to the cache.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use metrics::counter;
use tracing::{debug, info};

use super::keys::EntryId;
use super::lock::mutex_lock;
use super::refqueue::ReferenceQueue;
use super::registry::{KeyGuard, ReachabilityKeyRegistry};

const SOURCE: &str = "cache::object";

const METRIC_HIT: &str = "fragcache_object_hit_total";
const METRIC_MISS: &str = "fragcache_object_miss_total";
const METRIC_EVICT: &str = "fragcache_object_evict_total";

/// A value stored in an [`EventDrivenObjectCache`].
///
/// Dropping the last handle tells the cache the entry is gone.
pub struct Cached<V> {
    id: EntryId,
    value: V,
    released: Arc<ReferenceQueue>,
}

impl<V> Cached<V> {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn value(&self) -> &V {
        &self.value
    }
}

impl<V> Deref for Cached<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V: fmt::Debug> fmt::Debug for Cached<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cached")
            .field("id", &self.id)
            .field("value", &self.value)
            .finish()
    }
}

impl<V> Drop for Cached<V> {
    fn drop(&mut self) {
        self.released.enqueue(self.id);
    }
}

struct Slot<V> {
    id: EntryId,
    value: Weak<Cached<V>>,
    // Dropped with the slot; tells the registry the key is gone.
    _guard: KeyGuard,
}

struct ObjectState<K, V, E> {
    entries: HashMap<Arc<K>, Slot<V>>,
    keys_by_id: HashMap<EntryId, Arc<K>>,
    registry: ReachabilityKeyRegistry<K, E>,
}

impl<K, V, E> ObjectState<K, V, E>
where
    K: Hash + Eq,
    E: Hash + Eq + Clone,
{
    /// Remove entry `id` if it is still the one stored under its key.
    fn evict(&mut self, id: EntryId, reason: &'static str) -> bool {
        let Some(key) = self.keys_by_id.remove(&id) else {
            return false;
        };
        let current = self.entries.get(&key).is_some_and(|slot| slot.id == id);
        if current {
            self.entries.remove(&key);
            counter!(METRIC_EVICT, "reason" => reason).increment(1);
        }
        self.registry.unregister(id);
        current
    }

    /// Reclaim every entry whose value has been dropped.
    fn reclaim(&mut self, released: &ReferenceQueue) {
        let mut reclaimed = 0usize;
        for id in released.drain() {
            if self.evict(id, "dropped") {
                reclaimed += 1;
            }
        }
        self.registry.cleanup();
        if reclaimed > 0 {
            debug!(cache = "object", reclaimed, "reclaimed dropped values");
        }
    }
}

/// Cache whose entries live while their values are referenced and until an
/// event they depend on fires.
pub struct EventDrivenObjectCache<K, V, E> {
    state: Mutex<ObjectState<K, V, E>>,
    released: Arc<ReferenceQueue>,
    next_id: AtomicU64,
}

impl<K, V, E> EventDrivenObjectCache<K, V, E>
where
    K: Hash + Eq + fmt::Debug,
    E: Hash + Eq + Clone + fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ObjectState {
                entries: HashMap::new(),
                keys_by_id: HashMap::new(),
                registry: ReachabilityKeyRegistry::new(),
            }),
            released: Arc::new(ReferenceQueue::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Value stored under `key`, if it is still alive.
    pub fn get(&self, key: &K) -> Option<Arc<Cached<V>>> {
        let mut state = mutex_lock(&self.state, SOURCE, "get");
        state.reclaim(&self.released);

        let (id, value) = match state.entries.get(key) {
            Some(slot) => (slot.id, slot.value.upgrade()),
            None => {
                counter!(METRIC_MISS).increment(1);
                return None;
            }
        };

        match value {
            Some(value) => {
                counter!(METRIC_HIT).increment(1);
                Some(value)
            }
            None => {
                // Dropped, but its notification is not queued yet.
                state.evict(id, "dropped");
                counter!(METRIC_MISS).increment(1);
                None
            }
        }
    }

    /// Store `value` under `key`, invalidated by any of `events`.
    ///
    /// Returns the only strong handle to the stored value: the entry lives
    /// as long as the caller keeps it (or a clone of it).
    pub fn put<I>(&self, key: K, value: V, events: I) -> Arc<Cached<V>>
    where
        I: IntoIterator<Item = E>,
    {
        let id = EntryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cached = Arc::new(Cached {
            id,
            value,
            released: Arc::clone(&self.released),
        });

        let mut state = mutex_lock(&self.state, SOURCE, "put");
        state.reclaim(&self.released);

        if let Some(previous) = state.entries.get(&key).map(|slot| slot.id) {
            state.evict(previous, "replaced");
        }

        let key = Arc::new(key);
        for event in events {
            state.registry.register(event, id, &key);
        }
        let guard = state.registry.guard(id);
        state.entries.insert(
            Arc::clone(&key),
            Slot {
                id,
                value: Arc::downgrade(&cached),
                _guard: guard,
            },
        );
        debug!(cache = "object", key = ?key, entry = %id, "stored object");
        state.keys_by_id.insert(id, key);

        cached
    }

    /// Evict every entry registered under `event`.
    ///
    /// Returns the number of entries removed.
    pub fn handle_event(&self, event: &E) -> usize {
        let mut state = mutex_lock(&self.state, SOURCE, "handle_event");
        state.reclaim(&self.released);

        let affected = state.registry.invalidate(event);
        let mut evicted = 0usize;
        for (id, _key) in affected {
            if state.evict(id, "event") {
                evicted += 1;
            }
        }

        info!(cache = "object", event = ?event, evicted, "handled invalidation event");
        evicted
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "remove");
        state.reclaim(&self.released);
        match state.entries.get(key).map(|slot| slot.id) {
            Some(id) => state.evict(id, "removed"),
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.keys_by_id.clear();
        state.registry.clear();
        self.released.drain();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let mut state = mutex_lock(&self.state, SOURCE, "len");
        state.reclaim(&self.released);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn registry_key_count(&self) -> usize {
        let mut state = mutex_lock(&self.state, SOURCE, "registry_key_count");
        state.reclaim(&self.released);
        state.registry.key_count()
    }

    pub fn registry_event_count(&self) -> usize {
        let mut state = mutex_lock(&self.state, SOURCE, "registry_event_count");
        state.reclaim(&self.released);
        state.registry.event_count()
    }
}

impl<K, V, E> Default for EventDrivenObjectCache<K, V, E>
where
    K: Hash + Eq + fmt::Debug,
    E: Hash + Eq + Clone + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn cache() -> EventDrivenObjectCache<String, String, &'static str> {
        EventDrivenObjectCache::new()
    }

    #[test]
    fn put_then_get_returns_same_value() {
        let cache = cache();
        let stored = cache.put("k".to_string(), "v".to_string(), ["e"]);

        let found = cache.get(&"k".to_string()).expect("value is alive");
        assert!(Arc::ptr_eq(&stored, &found));
        assert_eq!(found.as_str(), "v");
    }

    #[test]
    fn dropping_last_handle_evicts_entry() {
        let cache = cache();
        let stored = cache.put("k".to_string(), "v".to_string(), ["e"]);
        assert_eq!(cache.registry_key_count(), 1);

        drop(stored);
        assert!(cache.get(&"k".to_string()).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.registry_key_count(), 0);
        assert_eq!(cache.registry_event_count(), 0);
    }

    #[test]
    fn event_evicts_immediately() {
        let cache = cache();
        let _a = cache.put("a".to_string(), "1".to_string(), ["e1"]);
        let _b = cache.put("b".to_string(), "2".to_string(), ["e2"]);

        assert_eq!(cache.handle_event(&"e1"), 1);
        assert!(cache.get(&"a".to_string()).is_none());
        assert!(cache.get(&"b".to_string()).is_some());
        assert_eq!(cache.registry_key_count(), 1);
    }

    #[test]
    fn entry_with_many_events_leaves_every_index() {
        let cache = cache();
        let _a = cache.put("a".to_string(), "1".to_string(), ["e1", "e2"]);

        assert_eq!(cache.handle_event(&"e2"), 1);
        assert_eq!(cache.registry_event_count(), 0);
        assert_eq!(cache.handle_event(&"e1"), 0);
    }

    #[test]
    fn replacement_keeps_new_value_after_old_handle_drops() {
        let cache = cache();
        let old = cache.put("k".to_string(), "old".to_string(), ["e"]);
        let new = cache.put("k".to_string(), "new".to_string(), ["e"]);

        drop(old);
        let found = cache.get(&"k".to_string()).expect("replacement survives");
        assert!(Arc::ptr_eq(&found, &new));
        assert_eq!(cache.registry_key_count(), 1);
    }

    #[test]
    fn entry_without_events_is_cached() {
        let cache = cache();
        let _kept = cache.put("k".to_string(), "v".to_string(), []);

        assert!(cache.get(&"k".to_string()).is_some());
        assert_eq!(cache.registry_event_count(), 0);
    }

    #[test]
    fn remove_and_clear() {
        let cache = cache();
        let _a = cache.put("a".to_string(), "1".to_string(), ["e"]);
        let _b = cache.put("b".to_string(), "2".to_string(), ["e"]);

        assert!(cache.remove(&"a".to_string()));
        assert!(!cache.remove(&"a".to_string()));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.registry_key_count(), 0);
    }

    #[test]
    fn object_cache_recovers_from_poisoned_lock() {
        let cache = cache();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = cache.state.lock().expect("state lock should be acquired");
            panic!("poison state lock");
        }));

        let _kept = cache.put("k".to_string(), "v".to_string(), ["e"]);
        assert!(cache.get(&"k".to_string()).is_some());
    }
}
