//! Derived-value caching with single-flight computation and event-driven
//! invalidation.

pub mod cache;
pub mod config;
pub mod infra;
