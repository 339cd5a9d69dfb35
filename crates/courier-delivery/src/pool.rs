//! Worker pool supervision.
//!
//! Spawns consumer loops as supervised tasks, tracks how many are live for
//! the status surface, and joins them within a bounded timeout on shutdown.
//! Dropping a pool that was never shut down cancels its tasks rather than
//! orphaning them.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{DeliveryError, Result};

/// Decrements the live gauge when a worker task ends, however it ends.
struct LiveGuard {
    live: Arc<AtomicUsize>,
}

impl LiveGuard {
    fn enter(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self { live }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Supervises one group of worker tasks sharing a cancellation token.
pub struct WorkerPool {
    name: &'static str,
    cancel: CancellationToken,
    live: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates an empty pool with its own live gauge.
    pub fn new(name: &'static str) -> Self {
        Self::with_gauge(name, Arc::new(AtomicUsize::new(0)))
    }

    /// Creates an empty pool reporting liveness into an external gauge, so
    /// the status surface keeps one gauge across restarts.
    pub fn with_gauge(name: &'static str, live: Arc<AtomicUsize>) -> Self {
        Self { name, cancel: CancellationToken::new(), live, handles: Vec::new() }
    }

    /// Token worker loops should watch for shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Gauge of currently-live worker loops. Shared with the status
    /// service.
    pub fn live_gauge(&self) -> Arc<AtomicUsize> {
        self.live.clone()
    }

    /// Spawns one supervised worker task.
    pub fn spawn<F>(&mut self, label: String, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let live = self.live.clone();
        let pool_name = self.name;

        let handle = tokio::spawn(async move {
            let _guard = LiveGuard::enter(live);
            info!(pool = pool_name, worker = %label, "worker starting");
            work.await;
            info!(pool = pool_name, worker = %label, "worker stopped");
        });
        self.handles.push(handle);
    }

    /// Adopts an externally spawned task into the pool's supervision.
    pub fn adopt(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Number of tasks spawned into this pool.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no tasks.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals cancellation and waits for every task to finish its
    /// in-flight message, up to `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<()> {
        info!(
            pool = self.name,
            workers = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "shutting down worker pool"
        );
        self.cancel.cancel();

        let handles = std::mem::take(&mut self.handles);
        let join_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!(pool = self.name, error = %e, "worker task panicked");
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!(pool = self.name, "worker pool shutdown complete");
                Ok(())
            },
            Err(_) => {
                error!(
                    pool = self.name,
                    timeout_seconds = timeout.as_secs(),
                    "worker pool shutdown timed out"
                );
                Err(DeliveryError::ShutdownTimeout { seconds: timeout.as_secs() })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() && !self.cancel.is_cancelled() {
            warn!(
                pool = self.name,
                workers = self.handles.len(),
                "worker pool dropped without shutdown; cancelling tasks"
            );
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_tracks_live_workers_and_shuts_down() {
        let mut pool = WorkerPool::new("test");
        let gauge = pool.live_gauge();
        let cancel = pool.cancellation_token();

        for i in 0..3 {
            let token = cancel.clone();
            pool.spawn(format!("worker-{i}"), async move {
                token.cancelled().await;
            });
        }

        // Give the tasks a moment to start.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while gauge.load(Ordering::Acquire) != 3 {
            assert!(std::time::Instant::now() < deadline, "workers never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.shutdown(Duration::from_secs(5)).await.expect("shutdown");
        assert_eq!(gauge.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_worker() {
        let mut pool = WorkerPool::new("stuck");
        pool.spawn("hang".to_string(), async {
            // Ignores cancellation entirely.
            std::future::pending::<()>().await;
        });

        let result = pool.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(DeliveryError::ShutdownTimeout { .. })));
    }
}
