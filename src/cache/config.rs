//! Cache configuration.
//!
//! Controls the tiered output cache and the invalidation pipeline via
//! `fragcache.toml` (`[cache]` table).

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_TTL_SECONDS: u64 = 60;
const DEFAULT_TTI_SECONDS: u64 = 0;
const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_UNCACHEABLE_KEY_LIMIT: usize = 5000;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 0;
const DEFAULT_SECOND_TIER_MAX_ENTRIES: usize = 10_000;
const DEFAULT_STALE_TIER_MAX_ENTRIES: usize = 10_000;
const DEFAULT_STALE_TTL_SECONDS: u64 = 3600;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1024;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;

/// Cache configuration from `fragcache.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live applied to entries created by the cache.
    pub ttl_seconds: u64,
    /// Time-to-idle applied to entries created by the cache (0 disables).
    pub tti_seconds: u64,
    /// Entries created by the cache never expire.
    pub eternal: bool,
    /// Maximum entries in the primary tier before LRU eviction.
    pub max_entries: usize,
    /// Maximum keys remembered as uncacheable.
    pub uncacheable_key_limit: usize,
    /// How long a reader waits for another thread's computation (0 waits forever).
    pub lock_timeout_ms: u64,
    /// Attach an in-process second tier when no external one is supplied.
    pub enable_second_tier: bool,
    /// Capacity of the in-process second tier.
    pub second_tier_max_entries: usize,
    /// Attach an in-process stale tier when no external one is supplied.
    pub enable_stale_tier: bool,
    /// Capacity of the in-process stale tier.
    pub stale_tier_max_entries: usize,
    /// Time-to-live of entries written to the stale tier.
    pub stale_ttl_seconds: u64,
    /// Maximum pending invalidation events before the oldest is dropped.
    pub event_queue_limit: usize,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            tti_seconds: DEFAULT_TTI_SECONDS,
            eternal: false,
            max_entries: DEFAULT_MAX_ENTRIES,
            uncacheable_key_limit: DEFAULT_UNCACHEABLE_KEY_LIMIT,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            enable_second_tier: false,
            second_tier_max_entries: DEFAULT_SECOND_TIER_MAX_ENTRIES,
            enable_stale_tier: false,
            stale_tier_max_entries: DEFAULT_STALE_TIER_MAX_ENTRIES,
            stale_ttl_seconds: DEFAULT_STALE_TTL_SECONDS,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn tti(&self) -> Duration {
        Duration::from_secs(self.tti_seconds)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_seconds)
    }

    /// `None` means readers wait until the computing thread stores an entry.
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_ms > 0).then(|| Duration::from_millis(self.lock_timeout_ms))
    }

    /// Returns the primary tier limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the uncacheable key limit as NonZeroUsize, clamping to 1 if zero.
    pub fn uncacheable_key_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.uncacheable_key_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the second tier limit as NonZeroUsize, clamping to 1 if zero.
    pub fn second_tier_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.second_tier_max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the stale tier limit as NonZeroUsize, clamping to 1 if zero.
    pub fn stale_tier_max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.stale_tier_max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the event queue limit, clamping to 1 if zero.
    pub fn event_queue_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.event_queue_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
