//! Supervised set of delivery workers with graceful shutdown.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::WebhookDispatcher,
    error::{DeliveryError, Result},
    queue::TaskQueue,
    worker::{DeliveryWorker, EngineStats, WorkerConfig},
};

/// Owns the worker tasks draining one task queue.
///
/// Call [`WorkerPool::shutdown_graceful`] before dropping; dropping a pool
/// with running workers cancels them without waiting.
pub struct WorkerPool {
    dispatcher: WebhookDispatcher,
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates a pool. No workers run until [`WorkerPool::spawn_workers`].
    pub fn new(
        dispatcher: WebhookDispatcher,
        queue: Arc<dyn TaskQueue>,
        config: WorkerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns `worker_count` workers and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `worker_count`, `batch_size` or
    /// `lease_duration` is zero.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if self.config.worker_count == 0 || self.config.batch_size == 0 {
            return Err(DeliveryError::configuration(
                "worker_count and batch_size must be greater than zero",
            ));
        }
        if self.config.lease_duration.is_zero() {
            return Err(DeliveryError::configuration("lease_duration must be greater than zero"));
        }

        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            lease_seconds = self.config.lease_duration.as_secs(),
            "spawning delivery workers"
        );

        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.dispatcher.clone(),
                self.queue.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        Ok(())
    }

    /// Snapshot of the pool counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Token that stops every worker of this pool when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Cancels all workers and waits for in-flight attempts to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the workers do not stop within
    /// `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();

        let shutdown_future = async move {
            let mut panicked = 0usize;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        panicked += 1;
                        let panic =
                            DeliveryError::WorkerPanic { worker_id, error: join_error.to_string() };
                        error!(worker_id, error = %panic, "worker task panicked during shutdown");
                    },
                }
            }

            stats.write().await.active_workers = 0;
            panicked
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(panicked) => {
                if panicked > 0 {
                    warn!(panicked, "some workers panicked before shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active_count,
                "worker pool dropped without graceful shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
