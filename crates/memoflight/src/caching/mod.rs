//! # The in-memory result cache
//!
//! Caching is front and center in the dispatcher. To guarantee smooth
//! operation, results of expensive computations are kept in memory for a
//! caller-supplied TTL and reused for every subsequent request.
//!
//! The store is the first of the two shared mutable structures in this crate
//! (the other being the coalescer's in-flight table). It only ever holds
//! fully computed values: a key that is still being computed lives in the
//! coalescer, and failed computations are published to their waiters but
//! never stored, so the next request after a failure recomputes instead of
//! replaying a stale error.
//!
//! Expiry is lazy. An expired entry is purged when a lookup encounters it
//! and is indistinguishable from a miss. Capacity is enforced on insert with
//! strict least-recently-used eviction, where every successful lookup counts
//! as a use.
//!
//! ### Metrics
//!
//! - `cache.hit` / `cache.miss`: lookups, with expired entries counting as
//!   misses.
//! - `cache.eviction`: entries evicted to make room for an insert.
//! - `cache.size`: entry count after each insert.

mod store;

pub use store::CacheStore;
