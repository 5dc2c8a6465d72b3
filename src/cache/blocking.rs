//! Primary tier: bounded in-process map with per-key compute locks.
//!
//! A reader that misses takes the lock on its key and is expected to store an
//! entry (a null marker will do) for it. Other readers of the same key park
//! until that happens.
//!
//! A null marker found on arrival counts as a miss, so the arriving reader
//! takes the lock like it would on an empty slot. A reader that parked behind
//! a computation gets back whatever that computation stored, null marker
//! included, unless the marker flags the key as uncacheable; then the reader
//! queues for the lock and computes its own value.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;
use tracing::debug;

use super::entry::TimedEntry;
use super::error::CacheError;
use super::lock::{condvar_wait, mutex_lock};

const SOURCE: &str = "cache::blocking";
const METRIC_EVICT: &str = "fragcache_output_evict_total";

struct Slot<K, V> {
    entry: TimedEntry<K, V>,
    last_access: Instant,
}

impl<K, V> Slot<K, V> {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        if self.entry.is_eternal() {
            return true;
        }
        if self.entry.is_expired_at(now) {
            return false;
        }
        let tti = self.entry.tti();
        tti.is_zero() || self.last_access.elapsed() < tti
    }
}

struct TierState<K: Hash + Eq, V> {
    entries: LruCache<K, Slot<K, V>>,
    locked: HashSet<K>,
}

impl<K: Hash + Eq + Clone, V> TierState<K, V> {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live_entry(&mut self, key: &K, now: OffsetDateTime) -> Option<&mut Slot<K, V>> {
        let live = self.entries.peek(key).map(|slot| slot.is_live(now))?;
        if !live {
            self.entries.pop(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    /// Store `entry` and release its key. Returns whether the key was locked.
    fn store(&mut self, entry: TimedEntry<K, V>) -> bool {
        let key = entry.key().clone();
        let slot = Slot {
            entry,
            last_access: Instant::now(),
        };
        if let Some((evicted, _)) = self.entries.push(key.clone(), slot)
            && evicted != key
        {
            counter!(METRIC_EVICT).increment(1);
        }
        self.locked.remove(&key)
    }
}

/// Outcome of [`BlockingTier::get_or_lock`].
#[derive(Debug)]
pub enum TierRead<K, V> {
    /// A live entry. It is a null marker only when the computation this
    /// caller waited on produced nothing.
    Present(TimedEntry<K, V>),
    /// Nothing servable; the caller now holds the key's compute lock.
    Locked,
}

pub struct BlockingTier<K: Hash + Eq, V> {
    state: Mutex<TierState<K, V>>,
    released: Condvar,
    lock_timeout: Option<Duration>,
    capacity: NonZeroUsize,
}

impl<K, V> BlockingTier<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    pub fn new(capacity: NonZeroUsize, lock_timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(TierState {
                entries: LruCache::new(capacity),
                locked: HashSet::new(),
            }),
            released: Condvar::new(),
            lock_timeout,
            capacity,
        }
    }

    /// Read `key`, taking its compute lock when nothing live is stored.
    ///
    /// Blocks while another caller holds the lock. Fails with
    /// [`CacheError::LockTimeout`] if a lock timeout is configured and runs out.
    pub fn get_or_lock(&self, key: &K) -> Result<TierRead<K, V>, CacheError> {
        let started = Instant::now();
        let deadline = self.lock_timeout.map(|timeout| started + timeout);
        let mut state = mutex_lock(&self.state, SOURCE, "get_or_lock");
        let mut waited = false;

        loop {
            let locked = state.locked.contains(key);
            if let Some(slot) = state.live_entry(key, OffsetDateTime::now_utc()) {
                let entry = &slot.entry;
                let servable = !entry.is_null_marker()
                    || (waited && !locked && entry.is_cacheable());
                if servable {
                    slot.last_access = Instant::now();
                    return Ok(TierRead::Present(slot.entry.clone()));
                }
            }

            if !locked {
                state.locked.insert(key.clone());
                return Ok(TierRead::Locked);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(CacheError::LockTimeout {
                            key: format!("{key:?}"),
                            waited: started.elapsed(),
                        });
                    }
                    Some(left)
                }
                None => None,
            };

            debug!(key = ?key, "waiting for in-flight computation");
            let (next, _timed_out) =
                condvar_wait(&self.released, state, remaining, SOURCE, "get_or_lock.wait");
            state = next;
            waited = true;
        }
    }

    /// Store `entry`, releasing the compute lock on its key.
    pub fn put(&self, entry: TimedEntry<K, V>) {
        let state = mutex_lock(&self.state, SOURCE, "put");
        self.store_and_notify(state, entry);
    }

    /// Store `entry` only if `clear_count` still reads `expected`.
    ///
    /// Otherwise a null marker takes its place, so the key's compute lock is
    /// released either way. The comparison and the store happen under the
    /// tier mutex, the same one [`invalidate`](Self::invalidate) bumps the
    /// counter under.
    pub fn put_if_unchanged(
        &self,
        entry: TimedEntry<K, V>,
        expected: u64,
        clear_count: &AtomicU64,
    ) -> bool {
        let state = mutex_lock(&self.state, SOURCE, "put_if_unchanged");
        if clear_count.load(Ordering::SeqCst) == expected {
            self.store_and_notify(state, entry);
            return true;
        }
        let mut marker = TimedEntry::null_marker(entry.key().clone(), entry.ttl());
        if !entry.is_cacheable() {
            marker = marker.uncacheable();
        }
        self.store_and_notify(state, marker);
        false
    }

    fn store_and_notify(
        &self,
        mut state: MutexGuard<'_, TierState<K, V>>,
        entry: TimedEntry<K, V>,
    ) {
        let was_locked = state.store(entry);
        drop(state);

        if was_locked {
            self.released.notify_all();
        }
    }

    /// Release the compute lock on `key` without storing anything.
    pub fn unlock(&self, key: &K) {
        let was_locked = mutex_lock(&self.state, SOURCE, "unlock").locked.remove(key);
        if was_locked {
            self.released.notify_all();
        }
    }

    /// Live entry for `key` without taking a lock or touching recency.
    pub fn peek(&self, key: &K) -> Option<TimedEntry<K, V>> {
        let state = mutex_lock(&self.state, SOURCE, "peek");
        let now = OffsetDateTime::now_utc();
        state
            .entries
            .peek(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.entry.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    pub fn is_locked(&self, key: &K) -> bool {
        mutex_lock(&self.state, SOURCE, "is_locked")
            .locked
            .contains(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        mutex_lock(&self.state, SOURCE, "remove")
            .entries
            .pop(key)
            .is_some()
    }

    /// Bump `clear_count` and drop every entry, atomically with respect to
    /// [`put_if_unchanged`](Self::put_if_unchanged). Held compute locks stay
    /// with their holders.
    pub fn invalidate(&self, clear_count: &AtomicU64) -> u64 {
        let mut state = mutex_lock(&self.state, SOURCE, "invalidate");
        let count = clear_count.fetch_add(1, Ordering::SeqCst) + 1;
        state.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }
}
