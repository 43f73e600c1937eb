//! A memoizing dispatcher for expensive, fallible computations.
//!
//! The crate revolves around [`MemoDispatcher`] and its single entry point,
//! [`get_or_compute`](MemoDispatcher::get_or_compute). A call either returns
//! a cached value, joins a computation that is already in flight for the same
//! key, or starts a new computation on a bounded worker pool. Computations
//! are retried with exponential backoff and bounded by a per-call deadline.
//!
//! The moving parts can also be used on their own:
//!
//! - [`caching::CacheStore`] is the TTL and LRU bounded result store.
//! - [`coalesce::Coalescer`] deduplicates concurrent computations per key.
//! - [`retry::RetryPolicy`] wraps one operation in retries and a deadline.
//! - [`pool::WorkerPool`] bounds how many computations run at once.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod coalesce;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod pool;
pub mod retry;


pub use crate::config::Config;
pub use crate::dispatch::MemoDispatcher;
pub use crate::error::{ComputeError, ComputeResult, OperationError};
