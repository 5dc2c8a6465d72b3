//! Tiered output cache.
//!
//! Memoizes rendered output across a blocking primary tier, an optional second
//! tier and an optional stale tier. Every miss leaves the caller with a
//! [`Pending`] fill obligation, which is what keeps readers parked on the
//! primary tier from waiting forever.

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use tracing::{debug, info, warn};

use super::blocking::{BlockingTier, TierRead};
use super::config::CacheConfig;
use super::entry::TimedEntry;
use super::error::{CacheError, ComputeError};
use super::lock::{rw_read, rw_write};
use super::store::{ExternalStore, MemoryStore};

const SOURCE: &str = "cache::output";

const METRIC_HIT: &str = "fragcache_output_hit_total";
const METRIC_MISS: &str = "fragcache_output_miss_total";
const METRIC_COMPUTE: &str = "fragcache_output_compute_total";
const METRIC_UNCACHEABLE: &str = "fragcache_output_uncacheable_total";
const METRIC_INVALIDATED: &str = "fragcache_output_invalidated_total";

const TIER_PRIMARY: &str = "primary";
const TIER_SECOND: &str = "second";
const TIER_STALE: &str = "stale";

/// Result of [`TieredOutputCache::get`].
pub enum Lookup<'a, K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    /// A live value, from the primary tier or reseeded from the second tier.
    /// Also the null marker left by a computation this caller waited on.
    Hit(TimedEntry<K, V>),
    /// Nothing servable; the caller must fill the key (see [`Pending`]).
    Miss(Pending<'a, K, V>),
}

impl<K, V> Lookup<'_, K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss(_))
    }
}

impl<K, V> fmt::Debug for Lookup<'_, K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Hit(entry) => f.debug_tuple("Hit").field(entry.key()).finish(),
            Lookup::Miss(pending) => f.debug_tuple("Miss").field(&pending.key).finish(),
        }
    }
}

/// Obligation to store an entry for a missed key.
///
/// Dropping a `Pending` without calling [`fill`](Pending::fill) stores a null
/// marker, so a panic or an early return can never strand readers blocked on
/// the key.
pub struct Pending<'a, K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    cache: &'a TieredOutputCache<K, V>,
    key: K,
    holds_lock: bool,
    done: bool,
}

impl<K, V> Pending<'_, K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether this caller holds the primary-tier compute lock.
    ///
    /// False when a stale value was seeded into the primary tier during the
    /// lookup: other readers are already served that value.
    pub fn holds_lock(&self) -> bool {
        self.holds_lock
    }

    /// Store `entry` through every tier. The entry is re-keyed to this key.
    pub fn fill(mut self, entry: TimedEntry<K, V>) {
        self.done = true;
        self.cache.put(entry.with_key(self.key.clone()));
    }

    /// Like [`fill`](Pending::fill), unless the cache was invalidated after
    /// `clear_count` was read; then the primary tier gets a null marker and
    /// the value only reaches the stale tier. Returns whether `entry` was
    /// published.
    pub fn fill_since(mut self, entry: TimedEntry<K, V>, clear_count: u64) -> bool {
        self.done = true;
        self.cache.publish(entry.with_key(self.key.clone()), clear_count)
    }

    /// Store a null marker: nothing worth caching was produced.
    pub fn abandon(mut self) {
        self.done = true;
        self.cache.put_null_marker(&self.key);
    }
}

impl<K, V> Drop for Pending<'_, K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    fn drop(&mut self) {
        if !self.done {
            debug!(key = ?self.key, "unfilled miss dropped; storing null marker");
            self.cache.put_null_marker(&self.key);
        }
    }
}

/// Output cache spanning a primary, a second and a stale tier.
pub struct TieredOutputCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    config: CacheConfig,
    primary: BlockingTier<K, V>,
    second: Option<Arc<dyn ExternalStore<K, V>>>,
    stale: Option<Arc<dyn ExternalStore<K, V>>>,
    uncacheable: RwLock<LruCache<K, ()>>,
    clear_count: AtomicU64,
}

impl<K, V> TieredOutputCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache from `config`.
    ///
    /// In-process second and stale tiers are attached when the config enables
    /// them; [`with_second_tier`](Self::with_second_tier) and
    /// [`with_stale_tier`](Self::with_stale_tier) replace them with external
    /// stores.
    pub fn new(config: &CacheConfig) -> Self {
        let second = config.enable_second_tier.then(|| {
            Arc::new(MemoryStore::new(
                TIER_SECOND,
                config.second_tier_max_entries_non_zero(),
            )) as Arc<dyn ExternalStore<K, V>>
        });
        let stale = config.enable_stale_tier.then(|| {
            Arc::new(
                MemoryStore::new(TIER_STALE, config.stale_tier_max_entries_non_zero())
                    .with_retention(config.stale_ttl()),
            ) as Arc<dyn ExternalStore<K, V>>
        });

        Self {
            config: config.clone(),
            primary: BlockingTier::new(config.max_entries_non_zero(), config.lock_timeout()),
            second,
            stale,
            uncacheable: RwLock::new(LruCache::new(config.uncacheable_key_limit_non_zero())),
            clear_count: AtomicU64::new(0),
        }
    }

    pub fn with_second_tier(mut self, store: Arc<dyn ExternalStore<K, V>>) -> Self {
        self.second = Some(store);
        self
    }

    pub fn with_stale_tier(mut self, store: Arc<dyn ExternalStore<K, V>>) -> Self {
        self.stale = Some(store);
        self
    }

    pub fn has_second_tier(&self) -> bool {
        self.second.is_some()
    }

    pub fn has_stale_tier(&self) -> bool {
        self.stale.is_some()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Look `key` up through the tier chain.
    ///
    /// Blocks while another caller is computing the same key.
    pub fn get(&self, key: &K) -> Result<Lookup<'_, K, V>, CacheError> {
        match self.primary.get_or_lock(key)? {
            TierRead::Present(entry) if entry.is_null_marker() => {
                debug!(
                    cache = "output",
                    outcome = "empty",
                    key = ?key,
                    "awaited computation produced nothing"
                );
                return Ok(Lookup::Hit(entry));
            }
            TierRead::Present(entry) => {
                debug!(cache = "output", tier = TIER_PRIMARY, outcome = "hit", key = ?key);
                counter!(METRIC_HIT, "tier" => TIER_PRIMARY).increment(1);
                return Ok(Lookup::Hit(entry));
            }
            TierRead::Locked => {}
        }

        if let Some(second) = &self.second
            && self.is_cacheable(key)
            && let Some(entry) = self.fetch(second.as_ref(), key)
        {
            match entry.remaining_ttl() {
                None => {
                    self.primary.put(entry.clone());
                    counter!(METRIC_HIT, "tier" => TIER_SECOND).increment(1);
                    return Ok(Lookup::Hit(entry));
                }
                Some(left) if !left.is_zero() => {
                    debug!(
                        cache = "output",
                        tier = TIER_SECOND,
                        outcome = "hit",
                        key = ?key,
                        remaining_ms = left.as_millis() as u64
                    );
                    let reseeded = entry.reseeded(left);
                    self.primary.put(reseeded.clone());
                    counter!(METRIC_HIT, "tier" => TIER_SECOND).increment(1);
                    return Ok(Lookup::Hit(reseeded));
                }
                Some(_) if self.stale.is_some() => {
                    debug!(
                        cache = "output",
                        tier = TIER_SECOND,
                        outcome = "expired",
                        key = ?key,
                        "serving expired value to others while recomputing"
                    );
                    self.primary.put(entry.reseeded(self.config.ttl()));
                    counter!(METRIC_MISS).increment(1);
                    return Ok(Lookup::Miss(self.pending(key, false)));
                }
                Some(_) => {}
            }
        }

        if let Some(stale) = &self.stale
            && let Some(entry) = self.fetch(stale.as_ref(), key)
        {
            debug!(
                cache = "output",
                tier = TIER_STALE,
                outcome = "hit",
                key = ?key,
                "seeding stale value while recomputing"
            );
            self.primary.put(entry.reseeded(self.config.ttl()));
            counter!(METRIC_HIT, "tier" => TIER_STALE).increment(1);
            counter!(METRIC_MISS).increment(1);
            return Ok(Lookup::Miss(self.pending(key, false)));
        }

        debug!(cache = "output", outcome = "miss", key = ?key);
        counter!(METRIC_MISS).increment(1);
        Ok(Lookup::Miss(self.pending(key, true)))
    }

    /// Return the cached value for `key`, computing it with `loader` on a miss.
    ///
    /// Only one caller computes a given key at a time; the others block on
    /// the primary tier and pick up whatever it stores, `None` if the
    /// computation failed. Keys known to be uncacheable are computed by each
    /// caller in turn. The loader's result is returned to this caller even
    /// when it cannot be cached.
    pub fn get_or_compute<F, E>(&self, key: &K, loader: F) -> Result<Option<V>, ComputeError<E>>
    where
        F: FnOnce() -> Result<Option<TimedEntry<K, V>>, E>,
    {
        let pending = match self.get(key)? {
            Lookup::Hit(entry) => return Ok(entry.into_value()),
            Lookup::Miss(pending) => pending,
        };

        let clear_count = self.clear_count.load(Ordering::SeqCst);
        counter!(METRIC_COMPUTE).increment(1);

        let computed = match loader() {
            Ok(computed) => computed,
            Err(err) => {
                pending.abandon();
                return Err(ComputeError::Loader(err));
            }
        };

        let Some(entry) = computed else {
            debug!(key = ?key, "loader returned nothing to cache");
            pending.abandon();
            return Ok(None);
        };
        let value = entry.value().cloned();

        if !pending.fill_since(entry, clear_count) {
            info!(
                key = ?key,
                "cache invalidated during computation; result kept out of primary tier"
            );
        }
        Ok(value)
    }

    /// Live primary-tier entry for `key`, null markers included.
    ///
    /// Never blocks and never takes the compute lock.
    pub fn peek(&self, key: &K) -> Option<TimedEntry<K, V>> {
        self.primary.peek(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.primary.contains_key(key)
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Store `entry` in every configured tier.
    ///
    /// An uncacheable entry becomes a null marker in the primary tier only,
    /// and its key skips the second tier from then on.
    pub fn put(&self, entry: TimedEntry<K, V>) {
        if !entry.is_cacheable() {
            debug!(key = ?entry.key(), "storing uncacheable marker");
            counter!(METRIC_UNCACHEABLE).increment(1);
            self.mark_uncacheable(entry.key().clone());
            self.primary.put(self.uncacheable_marker(entry.key()));
            return;
        }
        if entry.is_null_marker() {
            self.primary.put(entry);
            return;
        }

        self.primary.put(entry.clone());
        if let Some(second) = &self.second {
            self.store(second.as_ref(), entry.clone());
        }
        if let Some(stale) = &self.stale {
            self.store(stale.as_ref(), self.stale_copy(&entry));
        }
    }

    /// Remove `key` from the primary and second tiers.
    pub fn remove(&self, key: &K) -> bool {
        let removed = self.primary.remove(key);
        if let Some(second) = &self.second
            && let Err(err) = second.remove(key)
        {
            warn!(tier = second.name(), key = ?key, error = %err, "failed to remove entry");
        }
        removed
    }

    /// Flush the primary and second tiers.
    ///
    /// Computations already in flight will not publish their results to those
    /// tiers. The stale tier is kept as a last resort.
    pub fn invalidate_all(&self) {
        self.primary.invalidate(&self.clear_count);
        if let Some(second) = &self.second
            && let Err(err) = second.clear()
        {
            warn!(tier = second.name(), error = %err, "failed to clear tier");
        }
        rw_write(&self.uncacheable, SOURCE, "invalidate_all.uncacheable").clear();

        counter!(METRIC_INVALIDATED).increment(1);
        info!(cache = "output", "output cache invalidated");
    }

    /// Alias for [`invalidate_all`](Self::invalidate_all).
    pub fn clear(&self) {
        self.invalidate_all();
    }

    /// Whether `key` may be looked up in the second tier.
    pub fn is_cacheable(&self, key: &K) -> bool {
        !rw_read(&self.uncacheable, SOURCE, "is_cacheable").contains(key)
    }

    pub fn mark_uncacheable(&self, key: K) {
        rw_write(&self.uncacheable, SOURCE, "mark_uncacheable").put(key, ());
    }

    // ========================================================================
    // Entry construction and introspection
    // ========================================================================

    /// Entry carrying this cache's configured lifetime.
    pub fn create_entry(&self, key: K, value: V) -> TimedEntry<K, V> {
        TimedEntry::new(key, value, self.config.ttl())
            .with_tti(self.config.tti())
            .with_eternal(self.config.eternal)
    }

    pub fn create_uncacheable_entry(&self, key: K, value: V) -> TimedEntry<K, V> {
        self.create_entry(key, value).uncacheable()
    }

    /// Number of times the cache has been invalidated.
    pub fn clear_count(&self) -> u64 {
        self.clear_count.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn max_entries(&self) -> NonZeroUsize {
        self.primary.capacity()
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl()
    }

    pub fn tti(&self) -> Duration {
        self.config.tti()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn pending(&self, key: &K, holds_lock: bool) -> Pending<'_, K, V> {
        Pending {
            cache: self,
            key: key.clone(),
            holds_lock,
            done: false,
        }
    }

    /// Conditional counterpart of [`put`](Self::put) for computed entries.
    ///
    /// The primary store is conditional on `clear_count`. The second tier is
    /// written only after it succeeds, and the write is rolled back if an
    /// invalidation lands in between.
    fn publish(&self, entry: TimedEntry<K, V>, clear_count: u64) -> bool {
        let key = entry.key().clone();

        if !entry.is_cacheable() {
            counter!(METRIC_UNCACHEABLE).increment(1);
            let marker = self.uncacheable_marker(&key);
            let current = self
                .primary
                .put_if_unchanged(marker, clear_count, &self.clear_count);
            if current {
                debug!(key = ?key, "storing uncacheable marker");
                self.mark_uncacheable(key);
            }
            return current;
        }
        if entry.is_null_marker() {
            return self
                .primary
                .put_if_unchanged(entry, clear_count, &self.clear_count);
        }

        if let Some(stale) = &self.stale {
            self.store(stale.as_ref(), self.stale_copy(&entry));
        }
        if !self
            .primary
            .put_if_unchanged(entry.clone(), clear_count, &self.clear_count)
        {
            return false;
        }
        if let Some(second) = &self.second {
            self.store(second.as_ref(), entry);
            if self.clear_count.load(Ordering::SeqCst) != clear_count
                && let Err(err) = second.remove(&key)
            {
                warn!(tier = second.name(), key = ?key, error = %err, "failed to roll back entry");
            }
        }
        true
    }

    fn uncacheable_marker(&self, key: &K) -> TimedEntry<K, V> {
        TimedEntry::null_marker(key.clone(), self.config.ttl()).uncacheable()
    }

    fn stale_copy(&self, entry: &TimedEntry<K, V>) -> TimedEntry<K, V> {
        entry.reseeded(self.config.stale_ttl())
    }

    fn fetch(&self, store: &dyn ExternalStore<K, V>, key: &K) -> Option<TimedEntry<K, V>> {
        match store.get(key) {
            Ok(entry) => entry.filter(|entry| !entry.is_null_marker()),
            Err(err) => {
                warn!(tier = store.name(), key = ?key, error = %err, "tier read failed; treating as miss");
                None
            }
        }
    }

    fn store(&self, store: &dyn ExternalStore<K, V>, entry: TimedEntry<K, V>) {
        if let Err(err) = store.put(entry) {
            warn!(tier = store.name(), error = %err, "tier write failed");
        }
    }
}

impl<K, V> TieredOutputCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone,
{
    fn put_null_marker(&self, key: &K) {
        self.primary
            .put(TimedEntry::null_marker(key.clone(), self.config.ttl()));
    }
}
