//! Generic execution primitives: a fixed-size FIFO worker pool and a tracker
//! that joins a batch of subtasks with a bounded outstanding count.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::debug;

use crate::error::SnapshotError;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fixed-size pool executing submitted jobs in FIFO order. At most
/// `workers` jobs run at once; the rest queue.
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers)
            .map(|worker| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    debug!(worker, "worker pool worker exited");
                })
            })
            .collect();
        Arc::new(Self {
            tx,
            workers: Mutex::new(handles),
        })
    }

    pub fn submit(&self, job: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::pin(job))
            .map_err(|_| anyhow!("worker pool is shut down"))
    }

    /// Stops accepting jobs and aborts the workers. Queued jobs are dropped.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            handle.abort();
        }
    }
}

/// Joins a group of subtasks submitted to a [`WorkerPool`].
///
/// The first non-success result is sticky: every later [`TaskTracker::result`]
/// call observes it.
pub struct TaskTracker {
    outstanding: watch::Sender<usize>,
    result: Mutex<Option<SnapshotError>>,
}

impl TaskTracker {
    pub fn new() -> Arc<Self> {
        let (outstanding, _) = watch::channel(0);
        Arc::new(Self {
            outstanding,
            result: Mutex::new(None),
        })
    }

    pub fn spawn(
        self: &Arc<Self>,
        pool: &WorkerPool,
        task: impl Future<Output = Result<(), SnapshotError>> + Send + 'static,
    ) -> Result<()> {
        self.outstanding.send_modify(|count| *count += 1);
        let tracker = self.clone();
        let submitted = pool.submit(async move {
            if let Err(err) = task.await {
                tracker.record(err);
            }
            tracker.outstanding.send_modify(|count| *count -= 1);
        });
        if submitted.is_err() {
            self.outstanding.send_modify(|count| *count -= 1);
        }
        submitted
    }

    fn record(&self, err: SnapshotError) {
        let mut result = self.result.lock().unwrap();
        if result.is_none() {
            *result = Some(err);
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Blocks until at most `remaining` subtasks are still outstanding.
    pub async fn wait_some(&self, remaining: usize) {
        let mut rx = self.outstanding.subscribe();
        // the sender lives in self, so the channel cannot close mid-wait
        let _ = rx.wait_for(|count| *count <= remaining).await;
    }

    /// Blocks until every subtask has completed.
    pub async fn wait(&self) {
        self.wait_some(0).await;
    }

    pub fn result(&self) -> Option<SnapshotError> {
        self.result.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_pool_runs_submitted_jobs() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = watch::channel(0usize);
        for _ in 0..16 {
            let counter = counter.clone();
            let tx = tx.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send_modify(|done| *done += 1);
            })
            .unwrap();
        }
        let mut rx = tx.subscribe();
        rx.wait_for(|done| *done == 16).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tracker = TaskTracker::new();
        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            tracker
                .spawn(&pool, async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        tracker.wait().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(tracker.result().is_none());
    }

    #[tokio::test]
    async fn test_tracker_wait_some_bounds_outstanding() {
        let pool = WorkerPool::new(4);
        let tracker = TaskTracker::new();
        for _ in 0..4 {
            tracker
                .spawn(&pool, async move {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    Ok(())
                })
                .unwrap();
        }
        tracker.wait_some(1).await;
        assert!(tracker.outstanding() <= 1);
        tracker.wait().await;
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_tracker_first_error_is_sticky() {
        let pool = WorkerPool::new(1);
        let tracker = TaskTracker::new();
        tracker
            .spawn(&pool, async { Err(SnapshotError::internal("boom")) })
            .unwrap();
        tracker.wait().await;
        tracker.spawn(&pool, async { Ok(()) }).unwrap();
        tracker.wait().await;
        assert_eq!(tracker.result(), Some(SnapshotError::internal("boom")));
        // still the first error on a second read
        assert_eq!(tracker.result(), Some(SnapshotError::internal("boom")));
    }
}
