//! A bounded, supervised task pool.
//!
//! Every task's failure (error or panic) is logged and reported on the
//! failure channel; `drain` waits for everything still running.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

/// A task that did not finish cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
    pub panicked: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    spawned: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl PoolStats {
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

pub struct SupervisedPool {
    name: String,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    failures_tx: mpsc::UnboundedSender<TaskFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskFailure>>>,
    stats: Arc<PoolStats>,
}

impl SupervisedPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(size.max(1))),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Take the failure stream. Only the first caller gets it.
    pub async fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<TaskFailure>> {
        self.failures_rx.lock().await.take()
    }

    /// Run `task` once a slot is free. Returns immediately.
    pub fn spawn<F, E>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let label = label.into();
        let pool = self.name.clone();
        let permits = Arc::clone(&self.permits);
        let failures = self.failures_tx.clone();
        let stats = Arc::clone(&self.stats);
        stats.spawned.fetch_add(1, Ordering::Relaxed);

        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            // Inner task so a panic surfaces as a JoinError instead of
            // tearing down the supervisor.
            let outcome = match tokio::spawn(task).await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some((err.to_string(), false)),
                Err(join) => Some((join.to_string(), join.is_panic())),
            };

            match outcome {
                None => {
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(pool = %pool, task = %label, "supervised task finished");
                }
                Some((error, panicked)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(pool = %pool, task = %label, error = %error, panicked, "supervised task failed");
                    let _ = failures.send(TaskFailure {
                        task: label,
                        error,
                        panicked,
                        at: Utc::now(),
                    });
                }
            }
        });
    }

    /// Wait for every task spawned so far. The pool keeps accepting work.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work and wait for in-flight tasks.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failures_are_counted_and_reported() {
        let pool = SupervisedPool::new("test", 2);
        let mut failures = pool.take_failures().await.unwrap();
        assert!(pool.take_failures().await.is_none());

        pool.spawn("ok", async { Ok::<(), String>(()) });
        pool.spawn("err", async { Err::<(), String>("boom".into()) });
        pool.spawn("panic", async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), String>(())
        });
        pool.drain().await;

        assert_eq!(pool.stats().spawned(), 3);
        assert_eq!(pool.stats().succeeded(), 1);
        assert_eq!(pool.stats().failed(), 2);

        let mut reported = vec![failures.recv().await.unwrap(), failures.recv().await.unwrap()];
        reported.sort_by(|a, b| a.task.cmp(&b.task));
        assert_eq!(reported[0].task, "err");
        assert_eq!(reported[0].error, "boom");
        assert!(!reported[0].panicked);
        assert_eq!(reported[1].task, "panic");
        assert!(reported[1].panicked);
    }

    #[tokio::test]
    async fn pool_size_bounds_concurrency() {
        let pool = SupervisedPool::new("bounded", 2);
        let live = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        for i in 0..8 {
            let (live, peak) = (Arc::clone(&live), Arc::clone(&peak));
            pool.spawn(format!("t{i}"), async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), String>(())
            });
        }
        pool.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.stats().succeeded(), 8);
    }
}
