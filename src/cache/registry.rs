//! Reachability-aware event registry.
//!
//! Tracks which cache entries depend on which invalidation events, without
//! keeping their keys alive. A registration disappears once its key is no
//! longer reachable from the owning cache.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Weak};

use tracing::debug;

use super::keys::EntryId;
use super::refqueue::ReferenceQueue;

/// Reports an entry's key as unreachable when dropped.
///
/// The owning cache keeps one guard next to each key it holds; dropping the
/// guard (with the key) queues the registration for cleanup.
#[derive(Debug)]
pub struct KeyGuard {
    id: EntryId,
    queue: Arc<ReferenceQueue>,
}

impl KeyGuard {
    pub fn id(&self) -> EntryId {
        self.id
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.queue.enqueue(self.id);
    }
}

struct Registration<K, E> {
    key: Weak<K>,
    events: HashSet<E>,
}

/// Tracks event → entries and entry → (key, events) mappings.
///
/// This bidirectional mapping enables:
/// - Finding every live key affected by an event
/// - Dropping all of an entry's event links once its key is gone
///
/// Keys are held weakly. Cleanup happens on the next access, never in the
/// background.
pub struct ReachabilityKeyRegistry<K, E> {
    event_to_ids: HashMap<E, HashSet<EntryId>>,
    entries: HashMap<EntryId, Registration<K, E>>,
    released: Arc<ReferenceQueue>,
}

impl<K, E> ReachabilityKeyRegistry<K, E>
where
    E: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            event_to_ids: HashMap::new(),
            entries: HashMap::new(),
            released: Arc::new(ReferenceQueue::new()),
        }
    }

    /// Record that entry `id`, keyed by `key`, is invalidated by `event`.
    ///
    /// Registering more events for the same id accumulates them.
    pub fn register(&mut self, event: E, id: EntryId, key: &Arc<K>) {
        self.cleanup();
        self.event_to_ids
            .entry(event.clone())
            .or_default()
            .insert(id);
        self.entries
            .entry(id)
            .or_insert_with(|| Registration {
                key: Arc::downgrade(key),
                events: HashSet::new(),
            })
            .events
            .insert(event);
    }

    /// Guard that queues `id` for cleanup when dropped.
    pub fn guard(&self, id: EntryId) -> KeyGuard {
        KeyGuard {
            id,
            queue: Arc::clone(&self.released),
        }
    }

    /// Live keys registered under `event`.
    pub fn get(&mut self, event: &E) -> Vec<Arc<K>> {
        self.cleanup();
        self.live(event)
            .into_iter()
            .map(|(_, key)| key)
            .collect()
    }

    /// Remove every entry registered under `event`, in both directions.
    ///
    /// Returns the affected entries whose keys are still alive.
    pub fn invalidate(&mut self, event: &E) -> Vec<(EntryId, Arc<K>)> {
        self.cleanup();
        let affected = self.live(event);
        for (id, _) in &affected {
            self.unregister(*id);
        }
        self.event_to_ids.remove(event);
        affected
    }

    /// Drop all of `id`'s event links. Returns whether it was registered.
    pub fn unregister(&mut self, id: EntryId) -> bool {
        let Some(registration) = self.entries.remove(&id) else {
            return false;
        };
        for event in registration.events {
            if let Some(ids) = self.event_to_ids.get_mut(&event) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.event_to_ids.remove(&event);
                }
            }
        }
        true
    }

    /// Drop registrations whose keys were reported unreachable.
    ///
    /// Returns the number of registrations removed.
    pub fn cleanup(&mut self) -> usize {
        let removed = self
            .released
            .drain()
            .into_iter()
            .filter(|id| self.unregister(*id))
            .count();
        if removed > 0 {
            debug!(removed, "released unreachable registrations");
        }
        removed
    }

    /// Get the number of events with at least one registration.
    pub fn event_count(&self) -> usize {
        self.event_to_ids.len()
    }

    /// Get the number of registered entries.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Clear all mappings.
    pub fn clear(&mut self) {
        self.event_to_ids.clear();
        self.entries.clear();
        self.released.drain();
    }

    /// Entries under `event` with upgradable keys. Dead ones are unregistered.
    fn live(&mut self, event: &E) -> Vec<(EntryId, Arc<K>)> {
        let ids: Vec<EntryId> = self
            .event_to_ids
            .get(event)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            match self.entries.get(&id).and_then(|reg| reg.key.upgrade()) {
                Some(key) => live.push((id, key)),
                None => {
                    self.unregister(id);
                }
            }
        }
        live
    }
}

impl<K, E> Default for ReachabilityKeyRegistry<K, E>
where
    E: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ReachabilityKeyRegistry<String, &'static str> {
        ReachabilityKeyRegistry::new()
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = registry();
        let key = Arc::new("page:/news".to_string());

        registry.register("news", EntryId(1), &key);

        let keys = registry.get(&"news");
        assert_eq!(keys.len(), 1);
        assert!(Arc::ptr_eq(&keys[0], &key));
        assert!(registry.get(&"other").is_empty());
    }

    #[test]
    fn one_entry_many_events() {
        let mut registry = registry();
        let key = Arc::new("a".to_string());

        registry.register("e1", EntryId(1), &key);
        registry.register("e2", EntryId(1), &key);

        assert_eq!(registry.key_count(), 1);
        assert_eq!(registry.event_count(), 2);
    }

    #[test]
    fn invalidate_removes_both_directions() {
        let mut registry = registry();
        let key = Arc::new("a".to_string());
        registry.register("e1", EntryId(1), &key);
        registry.register("e2", EntryId(1), &key);

        let affected = registry.invalidate(&"e1");
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].0, EntryId(1));

        assert_eq!(registry.key_count(), 0);
        assert_eq!(registry.event_count(), 0);
        assert!(registry.get(&"e2").is_empty());
    }

    #[test]
    fn multiple_keys_for_same_event() {
        let mut registry = registry();
        let key1 = Arc::new("a".to_string());
        let key2 = Arc::new("b".to_string());

        registry.register("settings", EntryId(1), &key1);
        registry.register("settings", EntryId(2), &key2);

        let affected = registry.invalidate(&"settings");
        assert_eq!(affected.len(), 2);
    }

    #[test]
    fn dropped_guard_releases_registration_on_next_access() {
        let mut registry = registry();
        let key = Arc::new("a".to_string());
        registry.register("e", EntryId(1), &key);
        let guard = registry.guard(EntryId(1));

        drop(guard);
        assert_eq!(registry.key_count(), 1, "cleanup is lazy");

        assert_eq!(registry.cleanup(), 1);
        assert_eq!(registry.key_count(), 0);
        assert_eq!(registry.event_count(), 0);
    }

    #[test]
    fn unreachable_key_is_skipped_and_unregistered() {
        let mut registry = registry();
        let key = Arc::new("a".to_string());
        registry.register("e", EntryId(1), &key);

        drop(key);
        assert!(registry.get(&"e").is_empty());
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn unregister_unknown_id_is_noop() {
        let mut registry = registry();
        assert!(!registry.unregister(EntryId(9)));
    }

    #[test]
    fn clear_removes_all_mappings() {
        let mut registry = registry();
        let key = Arc::new("a".to_string());
        registry.register("e", EntryId(1), &key);
        let _guard = registry.guard(EntryId(1));

        registry.clear();
        assert_eq!(registry.key_count(), 0);
        assert_eq!(registry.event_count(), 0);
    }
}
