//! The memoizing dispatcher, tying all the pieces together.
//!
//! [`MemoDispatcher::get_or_compute`] is the single public entry point of
//! this crate: it consults the cache, coalesces concurrent requests for the
//! same key into one computation, runs that computation on the bounded
//! worker pool wrapped in the retry policy, and caches successful results
//! for the caller-supplied TTL.
//!
//! The dispatcher is an explicitly constructed, explicitly owned instance.
//! It holds the only two shared mutable structures (cache store and
//! in-flight table) and tears both down when dropped; there are no ambient
//! singletons.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::caching::CacheStore;
use crate::coalesce::{Coalescer, Flight, WaitHandle};
use crate::config::Config;
use crate::error::{ComputeError, ComputeResult, OperationError};
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;

/// Memoizes expensive or unreliable operations.
///
/// See the [module level documentation](self) for details.
pub struct MemoDispatcher<K, V> {
    store: Arc<CacheStore<K, V>>,
    coalescer: Coalescer<K, V>,
    retry: RetryPolicy,
    pool: WorkerPool,
}

impl<K, V> fmt::Debug for MemoDispatcher<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoDispatcher")
            .field("store", &self.store)
            .field("coalescer", &self.coalescer)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<K, V> MemoDispatcher<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a dispatcher according to `config`, spawning its workers onto
    /// the given runtime.
    pub fn new(config: &Config, runtime: tokio::runtime::Handle) -> Self {
        Self {
            store: Arc::new(CacheStore::new(config.max_cache_size)),
            coalescer: Coalescer::default(),
            retry: RetryPolicy::new(config.max_attempts, config.backoff_base, config.max_backoff),
            pool: WorkerPool::new(config.concurrency, config.queue_capacity, runtime),
        }
    }

    /// Returns the cached value for `key`, or computes it through
    /// `operation`.
    ///
    /// On a miss, concurrent callers for the same key share a single
    /// execution of `operation` and all observe its outcome. A successful
    /// result is cached for `ttl`; failures are never cached, so the next
    /// request after a failure computes afresh.
    ///
    /// The call as a whole is bounded by `deadline`. A caller whose deadline
    /// elapses while it waits gets [`ComputeError::DeadlineExceeded`]
    /// without cancelling the shared computation; the computation itself
    /// stops retrying once the deadline of the caller that started it has
    /// passed. If the worker pool queue is full, the call fails immediately
    /// with [`ComputeError::Overloaded`].
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: K,
        operation: F,
        ttl: Duration,
        deadline: Duration,
    ) -> ComputeResult<V>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, OperationError>> + Send + 'static,
    {
        metric!(counter("cache.access") += 1);

        if let Some(value) = self.store.lookup(&key) {
            tracing::trace!(?key, "Serving from cache");
            return Ok(value);
        }

        let deadline = Instant::now() + deadline;
        match self.coalescer.acquire_or_join(key.clone()) {
            Flight::Follower(handle) => {
                tracing::trace!(?key, "Joining in-flight computation");
                Self::await_outcome(handle, deadline).await
            }
            Flight::Leader(publisher, handle) => {
                let slot = match self.pool.try_acquire() {
                    Ok(slot) => slot,
                    Err(err) => {
                        tracing::debug!(?key, "Rejecting computation, worker pool saturated");
                        // Joined followers must not hang on a computation
                        // that never ran.
                        publisher.publish(Err(err.clone()));
                        return Err(err);
                    }
                };

                let store = Arc::clone(&self.store);
                let retry = self.retry;
                slot.submit(async move {
                    let start = Instant::now();
                    let outcome = retry.execute(deadline, operation).await;
                    metric!(timer("compute.duration") = start.elapsed());

                    if let Ok(value) = &outcome {
                        store.insert(key, value.clone(), ttl);
                    }
                    publisher.publish(outcome);
                });

                Self::await_outcome(handle, deadline).await
            }
        }
    }

    /// Removes the cached entry for `key`, regardless of its TTL.
    pub fn invalidate(&self, key: &K) {
        self.store.invalidate(key);
    }

    async fn await_outcome(handle: WaitHandle<V>, deadline: Instant) -> ComputeResult<V> {
        match time::timeout_at(deadline, handle.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ComputeError::DeadlineExceeded),
        }
    }
}
