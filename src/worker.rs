//! Bounded worker pools for batch and background jobs.
//!
//! A [`WorkerPool`] is `N` tokio tasks sharing one bounded queue. It is an
//! explicit lifecycle object: the bootstrapper calls [`WorkerPool::start`],
//! services call [`WorkerPool::try_submit`], and shutdown goes through
//! [`WorkerPool::shutdown`].
//!
//! ```text
//! try_submit ──► mpsc (bounded) ──► Mutex<Receiver> ──► worker 1..N ──► Job::run
//!                     │ full                                   │ panic
//!                     ▼                                        ▼
//!                 dropped + warn                           logged, worker survives
//! ```
//!
//! Submission never blocks: a full queue drops the job and returns
//! `false`. A pool-wide [`CancellationToken`] stops workers at their next
//! queue read and is handed to every running job.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A unit of work run by a [`WorkerPool`].
#[async_trait]
pub trait Job: Send + 'static {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}

type JobQueue = Arc<Mutex<mpsc::Receiver<Box<dyn Job>>>>;

pub struct WorkerPool {
    name: &'static str,
    tx: mpsc::Sender<Box<dyn Job>>,
    cancel: CancellationToken,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks reading from a queue of `capacity` jobs.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(name: &'static str, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue: JobQueue = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(worker_loop(name, id, queue.clone(), cancel.clone())))
            .collect();

        tracing::debug!(pool = name, workers, capacity, "worker pool started");

        Self {
            name,
            tx,
            cancel,
            handles: std::sync::Mutex::new(handles),
        }
    }

    /// Enqueue `job` without waiting. Returns `false` (and drops the job)
    /// when the queue is full or the pool is shut down.
    pub fn try_submit(&self, job: Box<dyn Job>) -> bool {
        if self.cancel.is_cancelled() {
            tracing::warn!(pool = self.name, job = job.name(), "pool is shut down, job dropped");
            return false;
        }
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(pool = self.name, job = job.name(), "worker queue full, job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::warn!(pool = self.name, job = job.name(), "worker queue closed, job dropped");
                false
            }
        }
    }

    /// Jobs waiting in the queue (not counting running ones).
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the pool and wait up to `timeout` for workers to finish their
    /// current job. Workers still running after that are aborted.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        if handles.is_empty() {
            return;
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures_util::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(pool = self.name, "worker pool shutdown timed out, aborting workers");
            for abort in aborts {
                abort.abort();
            }
        } else {
            tracing::debug!(pool = self.name, "worker pool stopped");
        }
    }
}

async fn worker_loop(name: &'static str, id: usize, queue: JobQueue, cancel: CancellationToken) {
    loop {
        let job = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        let job_name = job.name();
        match AssertUnwindSafe(job.run(cancel.clone())).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(pool = name, worker = id, job = job_name, error = %e, "job failed"),
            Err(_) => tracing::error!(pool = name, worker = id, job = job_name, "job panicked"),
        }
    }
    tracing::trace!(pool = name, worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl Job for Count {
        fn name(&self) -> &'static str {
            "count"
        }
        async fn run(self: Box<Self>, _: CancellationToken) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Block(Arc<Notify>);

    #[async_trait]
    impl Job for Block {
        fn name(&self) -> &'static str {
            "block"
        }
        async fn run(self: Box<Self>, _: CancellationToken) -> anyhow::Result<()> {
            self.0.notified().await;
            Ok(())
        }
    }

    struct Panic;

    #[async_trait]
    impl Job for Panic {
        fn name(&self) -> &'static str {
            "panic"
        }
        async fn run(self: Box<Self>, _: CancellationToken) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    async fn wait_for(counter: &AtomicUsize, n: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("counter never reached {n}");
    }

    #[tokio::test]
    async fn test_runs_jobs() {
        let pool = WorkerPool::start("test", 2, 8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            assert!(pool.try_submit(Box::new(Count(counter.clone()))));
        }
        wait_for(&counter, 5).await;
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let pool = WorkerPool::start("test", 1, 1);
        let gate = Arc::new(Notify::new());
        assert!(pool.try_submit(Box::new(Block(gate.clone()))));
        // Let the worker pick up the blocking job.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.try_submit(Box::new(Block(gate.clone()))));
        assert!(!pool.try_submit(Box::new(Block(gate.clone()))));
        assert_eq!(pool.queued(), 1);
        gate.notify_waiters();
        pool.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_survives_panic() {
        let pool = WorkerPool::start("test", 1, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(pool.try_submit(Box::new(Panic)));
        assert!(pool.try_submit(Box::new(Count(counter.clone()))));
        wait_for(&counter, 1).await;
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let pool = WorkerPool::start("test", 1, 4);
        pool.shutdown(Duration::from_secs(1)).await;
        assert!(pool.is_shut_down());
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(!pool.try_submit(Box::new(Count(counter))));
    }
}
