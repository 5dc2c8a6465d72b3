//! Timed cache entries shared by every tier.

use std::time::Duration;

use time::OffsetDateTime;

/// An immutable cached value with its expiry policy.
///
/// A `value` of `None` is a null marker: it records that the key was computed
/// (or failed) without producing anything worth serving, and releases any
/// compute lock held on the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEntry<K, V> {
    key: K,
    value: Option<V>,
    created_at: OffsetDateTime,
    ttl: Duration,
    tti: Duration,
    eternal: bool,
    cacheable: bool,
}

impl<K, V> TimedEntry<K, V> {
    /// Create a cacheable entry created now.
    pub fn new(key: K, value: V, ttl: Duration) -> Self {
        Self {
            key,
            value: Some(value),
            created_at: OffsetDateTime::now_utc(),
            ttl,
            tti: Duration::ZERO,
            eternal: false,
            cacheable: true,
        }
    }

    /// Create a null marker for `key`.
    pub fn null_marker(key: K, ttl: Duration) -> Self {
        Self {
            key,
            value: None,
            created_at: OffsetDateTime::now_utc(),
            ttl,
            tti: Duration::ZERO,
            eternal: false,
            cacheable: true,
        }
    }

    /// Mark the entry as not to be shared through any tier.
    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn with_tti(mut self, tti: Duration) -> Self {
        self.tti = tti;
        self
    }

    pub fn with_eternal(mut self, eternal: bool) -> Self {
        self.eternal = eternal;
        self
    }

    pub fn with_created_at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_key(mut self, key: K) -> Self {
        self.key = key;
        self
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn is_null_marker(&self) -> bool {
        self.value.is_none()
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs()
    }

    pub fn tti(&self) -> Duration {
        self.tti
    }

    pub fn is_eternal(&self) -> bool {
        self.eternal
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Time left before the entry expires, measured at `now`.
    ///
    /// `None` means the entry never expires. A zero duration means expired.
    pub fn remaining_ttl_at(&self, now: OffsetDateTime) -> Option<Duration> {
        if self.eternal {
            return None;
        }
        let elapsed = now - self.created_at;
        // Clock skew between processes can put created_at in the future.
        let elapsed: Duration = elapsed.try_into().unwrap_or(Duration::ZERO);
        Some(self.ttl.saturating_sub(elapsed))
    }

    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.remaining_ttl_at(OffsetDateTime::now_utc())
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        matches!(self.remaining_ttl_at(now), Some(left) if left.is_zero())
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Copy of this entry carrying the same value under a new lifetime,
    /// starting now.
    pub fn reseeded(&self, ttl: Duration) -> Self
    where
        K: Clone,
        V: Clone,
    {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            created_at: OffsetDateTime::now_utc(),
            ttl,
            tti: self.tti,
            eternal: self.eternal,
            cacheable: self.cacheable,
        }
    }
}
