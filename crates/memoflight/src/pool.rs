//! A bounded-concurrency executor for queued computations.
//!
//! The pool runs a fixed number of worker tasks which all consume from a
//! single bounded queue, so at most `concurrency` jobs execute at any given
//! moment and queued jobs are dispatched in submission order. When the queue
//! is full, submission fails immediately with
//! [`Overloaded`](ComputeError::Overloaded) instead of growing without
//! bound; callers are expected to shed that load.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::error::ComputeError;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs submitted jobs on a fixed number of workers.
///
/// Jobs communicate their results out of band (the dispatcher uses the
/// coalescer's outcome channel for that), the pool itself only drives them
/// to completion. Dropping the pool closes the queue; workers finish what
/// is queued and exit.
pub struct WorkerPool {
    queue: mpsc::Sender<Job>,
    concurrency: usize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("concurrency", &self.concurrency)
            .field("queue_slots", &self.queue.capacity())
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool with `concurrency` workers and a queue holding at most
    /// `queue_capacity` pending jobs, spawned onto the given runtime.
    pub fn new(concurrency: usize, queue_capacity: usize, runtime: tokio::runtime::Handle) -> Self {
        let concurrency = concurrency.max(1);
        let (queue, receiver) = mpsc::channel(queue_capacity.max(1));

        // All workers share the receiving end. The lock is only held while
        // waiting for the next job, never while running one.
        let receiver = Arc::new(AsyncMutex::new(receiver));
        for worker in 0..concurrency {
            let receiver = Arc::clone(&receiver);
            runtime.spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
                tracing::trace!(worker, "Worker pool queue closed, worker exiting");
            });
        }

        Self { queue, concurrency }
    }

    /// Claims a queue slot, failing fast when saturated.
    ///
    /// Splitting the claim from the submission lets callers find out about
    /// rejection before committing resources to the job.
    pub fn try_acquire(&self) -> Result<JobSlot<'_>, ComputeError> {
        self.queue.try_reserve().map(JobSlot).map_err(|err| match err {
            mpsc::error::TrySendError::Full(()) => {
                metric!(counter("dispatch.rejected") += 1);
                ComputeError::Overloaded
            }
            // Workers only go away when the pool is dropped, so this is
            // unreachable through the public API.
            err @ mpsc::error::TrySendError::Closed(()) => ComputeError::from_std_error(err),
        })
    }

    /// Queues `job` for execution, failing fast when saturated.
    pub fn try_submit<F>(&self, job: F) -> Result<(), ComputeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.try_acquire().map(|slot| slot.submit(job))
    }
}

/// A claimed slot in the pool's queue.
pub struct JobSlot<'a>(mpsc::Permit<'a, Job>);

impl JobSlot<'_> {
    /// Hands `job` to the pool; this cannot fail anymore.
    pub fn submit<F>(self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.send(Box::pin(job));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::channel::oneshot;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_jobs_run_in_submission_order() {
        let pool = WorkerPool::new(1, 16, tokio::runtime::Handle::current());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut done = Vec::new();
        for index in 0..5 {
            let order = Arc::clone(&order);
            let (sender, receiver) = oneshot::channel();
            done.push(receiver);
            pool.try_submit(async move {
                order.lock().unwrap().push(index);
                sender.send(()).ok();
            })
            .unwrap();
        }

        for receiver in done {
            receiver.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2, 16, tokio::runtime::Handle::current());
        let running = Arc::new(AtomicUsize::new(0));
        let max_overlap = Arc::new(AtomicUsize::new(0));

        let mut done = Vec::new();
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let max_overlap = Arc::clone(&max_overlap);
            let (sender, receiver) = oneshot::channel();
            done.push(receiver);
            pool.try_submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_overlap.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                sender.send(()).ok();
            })
            .unwrap();
        }

        for receiver in done {
            receiver.await.unwrap();
        }
        assert!(max_overlap.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_rejects() {
        let pool = WorkerPool::new(1, 1, tokio::runtime::Handle::current());

        // The queue holds one job; nothing has been handed to a worker yet,
        // so the second submission must be rejected rather than block.
        let (_blocker, blocked) = oneshot::channel::<()>();
        pool.try_submit(async move {
            blocked.await.ok();
        })
        .unwrap();

        let rejected = pool.try_submit(async {});
        assert_eq!(rejected, Err(ComputeError::Overloaded));
    }
}
