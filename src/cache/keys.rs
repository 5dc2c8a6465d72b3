//! Cache key definitions.
//!
//! Defines `FragmentKey` for rendered output and `EntryId` for object-cache
//! bookkeeping.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifies one rendered fragment.
///
/// Content-addressed: two requests that select the same namespace, path and
/// parameters (in any order) produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    namespace: String,
    path: String,
    params_hash: u64,
}

impl FragmentKey {
    pub fn new<'a, I>(namespace: impl Into<String>, path: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            namespace: namespace.into(),
            path: path.into(),
            params_hash: hash_params(params),
        }
    }

    /// Key for a path with no selector parameters.
    pub fn for_path(namespace: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(namespace, path, std::iter::empty())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params_hash(&self) -> u64 {
        self.params_hash
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{:016x}", self.namespace, self.path, self.params_hash)
    }
}

/// Identity of one object-cache insertion.
///
/// Every `put` gets a fresh id, so a replaced entry's late drop notification
/// can never be mistaken for the entry that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

// ============================================================================
// Hash Utilities
// ============================================================================

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hash selector parameters independent of their order.
pub fn hash_params<'a, I>(params: I) -> u64
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut pairs: Vec<(&str, &str)> = params.into_iter().collect();
    pairs.sort_unstable();
    hash_value(&pairs)
}

/// Hash a raw query string (`a=1&b=2`) as selector parameters.
pub fn hash_query(query: &str) -> u64 {
    hash_params(query.split('&').filter(|pair| !pair.is_empty()).map(|pair| {
        match pair.split_once('=') {
            Some((name, value)) => (name, value),
            None => (pair, ""),
        }
    }))
}
