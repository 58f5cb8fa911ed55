// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bounded background work queue
//!
//! Fire-and-forget work (mirror calls, the initial tree pull) goes through a
//! bounded flume channel drained by a fixed pool of tokio workers. Producers
//! may be kernel-facing threads outside the runtime; those use
//! [`WorkQueue::try_submit`] and never wait for a slot.
//!
//! With a single worker, jobs run strictly in submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub type Job = BoxFuture<'static, ()>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue is full")]
    Full,

    #[error("work queue is shut down")]
    Closed,
}

/// Counters exposed for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
}

impl QueueStats {
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed)
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
}

pub struct WorkQueue {
    name: &'static str,
    tx: flume::Sender<Job>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Spawn `workers` consumers on `runtime` behind a queue of `capacity` jobs.
    pub fn start(name: &'static str, runtime: &Handle, capacity: usize, workers: usize) -> Self {
        let (tx, rx) = flume::bounded::<Job>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let shutdown = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let counters = counters.clone();
                let shutdown = shutdown.clone();
                runtime.spawn(worker_loop(name, id, rx, counters, shutdown))
            })
            .collect();

        info!(queue = name, capacity, workers, "Work queue started");
        Self {
            name,
            tx,
            counters,
            shutdown,
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue without waiting; [`QueueError::Full`] when no slot is free.
    pub fn try_submit(&self, job: Job) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.tx.try_send(job).map_err(|e| match e {
            flume::TrySendError::Full(_) => QueueError::Full,
            flume::TrySendError::Disconnected(_) => QueueError::Closed,
        })?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn submit_async(&self, job: Job) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.tx
            .send_async(job)
            .await
            .map_err(|_| QueueError::Closed)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, run whatever is already queued, then wait for the
    /// workers to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        let stats = self.stats();
        info!(
            queue = self.name,
            submitted = stats.submitted,
            completed = stats.completed,
            "Work queue drained"
        );
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

async fn worker_loop(
    name: &'static str,
    id: usize,
    rx: flume::Receiver<Job>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
) {
    debug!(queue = name, worker = id, "Worker started");
    loop {
        tokio::select! {
            biased;
            job = rx.recv_async() => match job {
                Ok(job) => {
                    job.await;
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => break,
            },
            _ = shutdown.cancelled() => {
                while let Ok(job) = rx.try_recv() {
                    job.await;
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                break;
            }
        }
    }
    debug!(queue = name, worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_single_worker_preserves_order() {
        let queue = WorkQueue::start("test", &Handle::current(), 16, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8 {
            let seen = seen.clone();
            queue
                .submit_async(Box::pin(async move {
                    if i % 2 == 0 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    seen.lock().push(i);
                }))
                .await
                .unwrap();
        }
        queue.shutdown().await;

        assert_eq!(*seen.lock(), (0..8).collect::<Vec<_>>());
        assert_eq!(queue.stats().completed, 8);
    }

    #[tokio::test]
    async fn test_full_queue_reports_back_pressure() {
        let queue = WorkQueue::start("test", &Handle::current(), 1, 1);
        let (release, gate) = oneshot::channel::<()>();
        let (started_tx, started) = oneshot::channel::<()>();

        queue
            .try_submit(Box::pin(async move {
                let _ = started_tx.send(());
                let _ = gate.await;
            }))
            .unwrap();
        started.await.unwrap();

        // Worker is busy; one slot left in the channel.
        queue.try_submit(Box::pin(async {})).unwrap();
        assert_eq!(queue.try_submit(Box::pin(async {})), Err(QueueError::Full));

        release.send(()).unwrap();
        queue.shutdown().await;
        assert_eq!(queue.stats().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let queue = WorkQueue::start("test", &Handle::current(), 4, 2);
        queue.shutdown().await;
        assert_eq!(queue.try_submit(Box::pin(async {})), Err(QueueError::Closed));
    }

    #[test]
    fn test_submit_from_plain_thread() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queue = Arc::new(WorkQueue::start("test", runtime.handle(), 8, 1));
        let (tx, rx) = std::sync::mpsc::channel();

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..5 {
                    let tx = tx.clone();
                    queue
                        .try_submit(Box::pin(async move {
                            let _ = tx.send(i);
                        }))
                        .unwrap();
                }
            })
        };
        producer.join().unwrap();

        let received: Vec<_> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        runtime.block_on(queue.shutdown());
    }
}
