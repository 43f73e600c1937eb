//! Single-flight coalescing of concurrent computations.
//!
//! The first caller asking for a key becomes the *leader* and is responsible
//! for running the computation and publishing its outcome. Every caller that
//! arrives while the leader is still in flight becomes a *follower* and is
//! handed a wait handle resolving to the leader's outcome. At most one
//! computation per key is ever in flight.
//!
//! The in-flight table is the second shared mutable structure in this crate,
//! next to the cache store. Followers wait on a [`Shared`] oneshot receiver,
//! so polling for an outcome never holds the table lock.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::FutureExt as _;
use futures::channel::oneshot;
use futures::future::Shared;

use crate::error::{ComputeError, ComputeResult};

/// We want a shared future here because otherwise polling for an outcome
/// would hold the table lock.
type OutcomeChannel<V> = Shared<oneshot::Receiver<ComputeResult<V>>>;

type InFlightMap<K, V> = Arc<Mutex<HashMap<K, OutcomeChannel<V>>>>;

/// Deduplicates concurrent computations per key.
///
/// See the [module level documentation](self) for details.
pub struct Coalescer<K, V> {
    in_flight: InFlightMap<K, V>,
}

impl<K, V> fmt::Debug for Coalescer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .in_flight
            .try_lock()
            .map(|m| m.len())
            .unwrap_or_default();
        f.debug_struct("Coalescer")
            .field("in_flight", &in_flight)
            .finish()
    }
}

impl<K, V> Default for Coalescer<K, V> {
    fn default() -> Self {
        Self {
            in_flight: Arc::default(),
        }
    }
}

/// The caller's role in a computation, as decided by [`Coalescer::acquire_or_join`].
pub enum Flight<K: Eq + Hash, V> {
    /// This caller is responsible for running the computation and publishing
    /// its outcome through the [`Publisher`]. The [`WaitHandle`] resolves
    /// once that happened, like any follower's.
    Leader(Publisher<K, V>, WaitHandle<V>),
    /// Another caller is already computing this key; the handle resolves to
    /// that leader's outcome.
    Follower(WaitHandle<V>),
}

/// The leader's obligation to broadcast an outcome.
///
/// Publishing removes the pending record, making the key available for a
/// fresh leader afterwards. If the publisher is dropped without publishing
/// (the leader was cancelled), the record is removed as well and all waiters
/// resolve to [`ComputeError::DeadlineExceeded`] instead of hanging.
pub struct Publisher<K: Eq + Hash, V> {
    key: K,
    sender: Option<oneshot::Sender<ComputeResult<V>>>,
    in_flight: InFlightMap<K, V>,
}

impl<K: Eq + Hash, V> Publisher<K, V> {
    /// Broadcasts `outcome` to all waiters and retires the pending record.
    pub fn publish(mut self, outcome: ComputeResult<V>) {
        if let Some(sender) = self.sender.take() {
            self.in_flight.lock().unwrap().remove(&self.key);
            sender.send(outcome).ok();
        }
    }
}

impl<K: Eq + Hash, V> Drop for Publisher<K, V> {
    fn drop(&mut self) {
        // Still unpublished, so the record in the table is ours to clean up.
        // The dropped sender wakes all waiters with a cancellation.
        if self.sender.is_some() {
            self.in_flight.lock().unwrap().remove(&self.key);
        }
    }
}

/// Resolves to the outcome the leader published for this key.
pub struct WaitHandle<V> {
    channel: OutcomeChannel<V>,
}

impl<V: Clone> WaitHandle<V> {
    /// Waits for the leader's outcome.
    pub async fn wait(self) -> ComputeResult<V> {
        match self.channel.await {
            Ok(outcome) => outcome,
            // The leader was dropped before it could publish.
            Err(oneshot::Canceled) => Err(ComputeError::DeadlineExceeded),
        }
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Registers interest in a computation for `key`.
    ///
    /// The first caller for a key becomes the leader; everyone else joins as
    /// a follower until the leader publishes and thereby retires the key.
    pub fn acquire_or_join(&self, key: K) -> Flight<K, V> {
        let mut in_flight = self.in_flight.lock().unwrap();

        if let Some(channel) = in_flight.get(&key) {
            metric!(counter("dispatch.coalesced") += 1);
            return Flight::Follower(WaitHandle {
                channel: channel.clone(),
            });
        }

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        in_flight.insert(key.clone(), channel.clone());

        let publisher = Publisher {
            key,
            sender: Some(sender),
            in_flight: Arc::clone(&self.in_flight),
        };
        Flight::Leader(publisher, WaitHandle { channel })
    }
}
