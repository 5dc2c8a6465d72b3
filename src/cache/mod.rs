//! fragcache cache system
//!
//! Provides two caches for derived values:
//!
//! - **Output cache** ([`TieredOutputCache`]): memoizes rendered fragments
//!   across a blocking primary tier, a second tier and a stale tier, with
//!   single-flight computation per key
//! - **Object cache** ([`EventDrivenObjectCache`]): holds objects while they
//!   are referenced and drops them when an event they depend on fires
//!
//! Invalidation flows through an [`EventQueue`] drained by an
//! [`InvalidationConsumer`].
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `fragcache.toml`:
//!
//! ```toml
//! [cache]
//! ttl_seconds = 60
//! max_entries = 1000
//! enable_stale_tier = true
//! # ... see config.rs for all options
//! ```

mod blocking;
mod config;
mod consumer;
mod entry;
mod error;
mod events;
mod keys;
mod lock;
mod object;
mod output;
mod planner;
mod refqueue;
mod registry;
mod store;
mod translate;

pub use blocking::{BlockingTier, TierRead};
pub use config::CacheConfig;
pub use consumer::{ConsumeReport, EventSink, InvalidationConsumer, OutputSink};
pub use entry::TimedEntry;
pub use error::{CacheError, ComputeError, StoreError, TranslateError};
pub use events::{CacheEvent, Epoch, EventQueue, InvalidationSignal};
pub use keys::{EntryId, FragmentKey, hash_params, hash_query, hash_value};
pub use object::{Cached, EventDrivenObjectCache};
pub use output::{Lookup, Pending, TieredOutputCache};
pub use planner::InvalidationPlan;
pub use refqueue::ReferenceQueue;
pub use registry::{KeyGuard, ReachabilityKeyRegistry};
pub use store::{ExternalStore, MemoryStore};
pub use translate::{EventPathTranslator, RootPathTranslator};
