//! Bounded pool for detached background work (repair, full sweeps).
//!
//! Callers never wait on pool tasks. A task that fails reports its error on
//! the pool's error channel instead of to whoever scheduled it; a task that
//! cannot get a slot is dropped and counted.

use crate::farm::FarmError;
use farm_metrics::FarmMetrics;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Error channel depth. Reports beyond this are logged and discarded.
const ERROR_CHANNEL_CAPACITY: usize = 1024;

/// An error raised by a background task.
#[derive(Debug, Clone)]
pub struct BackgroundError {
    pub task: &'static str,
    pub error: FarmError,
}

#[derive(Debug)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    token: CancellationToken,
    errors: mpsc::Sender<BackgroundError>,
    metrics: Arc<FarmMetrics>,
}

impl TaskPool {
    /// Create a pool running at most `capacity` tasks at once, plus the
    /// receiving end of its error channel.
    pub fn new(
        capacity: usize,
        metrics: Arc<FarmMetrics>,
    ) -> (Self, mpsc::Receiver<BackgroundError>) {
        let (errors, rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let pool = Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
            errors,
            metrics,
        };
        (pool, rx)
    }

    /// Run `fut` in the background if a slot is free. Returns `false` if the
    /// task was dropped (pool full or shut down).
    pub fn spawn<F>(&self, task: &'static str, fut: F) -> bool
    where
        F: Future<Output = Result<(), FarmError>> + Send + 'static,
    {
        if self.token.is_cancelled() {
            tracing::debug!(task, "pool shut down, not spawning");
            return false;
        }
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.metrics.background_dropped.inc();
                tracing::warn!(task, "background pool full, dropping task");
                return false;
            }
        };

        let token = self.token.clone();
        let errors = self.errors.clone();
        let metrics = self.metrics.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            let result = tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(task, "background task cancelled");
                    return;
                }
                result = fut => result,
            };
            if let Err(error) = result {
                metrics.background_failures.inc();
                tracing::warn!(task, %error, "background task failed");
                if errors.try_send(BackgroundError { task, error }).is_err() {
                    tracing::debug!(task, "error channel full or closed");
                }
            }
        });
        true
    }

    /// Run a long-lived service. It holds no slot and must watch
    /// [`TaskPool::token`] to stop.
    pub fn spawn_service<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(fut);
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks and services still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel everything and wait for it to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("background pool stopped");
    }

    /// Wait for every running task, services included, without cancelling.
    /// The pool keeps accepting work afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    fn pool(capacity: usize) -> (TaskPool, mpsc::Receiver<BackgroundError>, Arc<FarmMetrics>) {
        let metrics = Arc::new(FarmMetrics::new().unwrap());
        let (pool, rx) = TaskPool::new(capacity, metrics.clone());
        (pool, rx, metrics)
    }

    #[tokio::test]
    async fn test_errors_reach_the_channel() {
        let (pool, mut rx, metrics) = pool(4);
        assert!(pool.spawn("ok", async { Ok(()) }));
        assert!(pool.spawn("bad", async { Err(FarmError::RepairTimeout) }));
        pool.drain().await;

        let report = rx.try_recv().unwrap();
        assert_eq!(report.task, "bad");
        assert!(matches!(report.error, FarmError::RepairTimeout));
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.background_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_full_pool_drops_work() {
        let (pool, _rx, metrics) = pool(1);
        let gate = Arc::new(tokio::sync::Notify::new());
        let g = gate.clone();
        assert!(pool.spawn("slow", async move {
            g.notified().await;
            Ok(())
        }));
        assert!(!pool.spawn("dropped", async { Ok(()) }));
        assert_eq!(metrics.background_dropped.get(), 1);

        gate.notify_one();
        pool.drain().await;
        assert!(pool.spawn("after", async { Ok(()) }));
        pool.drain().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_tasks() {
        let (pool, _rx, _) = pool(4);
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        pool.spawn("forever", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let token = pool.token();
        pool.spawn_service(async move { token.cancelled().await });

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(pool.is_shutdown());
        assert!(!pool.spawn("late", async { Ok(()) }));
    }
}
