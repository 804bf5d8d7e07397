//! Queue-draining delivery worker.
//!
//! Each worker leases due delivery IDs from the task queue and runs one
//! dispatcher attempt per ID. A lease hides the task from other workers, so
//! two workers never attempt the same delivery concurrently. The lease is
//! completed once the dispatcher has persisted the outcome; when processing
//! fails the lease is left to expire and the delivery is claimed again.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::{AttemptOutcome, WebhookDispatcher},
    error::{DeliveryError, Result},
    queue::{Lease, TaskQueue},
};

/// Back-off after a failed claim before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Worker runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum tasks to claim per batch.
    pub batch_size: usize,

    /// Idle wait between polls when the queue has nothing due.
    pub poll_interval: Duration,

    /// Maximum time to wait for workers on shutdown.
    pub shutdown_timeout: Duration,

    /// How long a claimed task stays hidden from other workers. Must exceed
    /// the longest delivery timeout, or a slow attempt is taken over while
    /// still in flight.
    pub lease_duration: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            lease_duration: crate::DEFAULT_LEASE_DURATION,
        }
    }
}

/// Counters shared by all workers of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of running workers.
    pub active_workers: usize,
    /// Delivery IDs claimed and handed to the dispatcher.
    pub processed: u64,
    /// Attempts answered with 2xx.
    pub succeeded: u64,
    /// Failed attempts, including those that exhausted the delivery.
    pub failed: u64,
    /// Deliveries that ran out of attempts.
    pub exhausted: u64,
    /// Deliveries whose processing failed; they are retried once their lease
    /// expires.
    pub errors: u64,
}

impl EngineStats {
    fn record(&mut self, outcome: &Result<AttemptOutcome>) {
        self.processed += 1;
        match outcome {
            Ok(AttemptOutcome::Delivered { .. }) => self.succeeded += 1,
            Ok(AttemptOutcome::RetryScheduled { .. }) => self.failed += 1,
            Ok(AttemptOutcome::Exhausted { .. }) => {
                self.failed += 1;
                self.exhausted += 1;
            },
            Ok(AttemptOutcome::Skipped { .. }) => {},
            Err(_) => self.errors += 1,
        }
    }
}

/// Single worker draining the task queue.
pub struct DeliveryWorker {
    id: usize,
    dispatcher: WebhookDispatcher,
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a worker. `queue` must be the queue the dispatcher enqueues
    /// into.
    pub fn new(
        id: usize,
        dispatcher: WebhookDispatcher,
        queue: Arc<dyn TaskQueue>,
        config: WorkerConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, dispatcher, queue, config, stats, cancellation_token, clock }
    }

    /// Claims and processes batches until cancelled.
    ///
    /// # Errors
    ///
    /// Never fails today; claim and attempt errors are logged and the loop
    /// continues.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker batch processing failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(ERROR_BACKOFF) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims one batch and processes it. Returns the number of claimed
    /// deliveries.
    ///
    /// # Errors
    ///
    /// Returns `Queue` if claiming fails. Per-delivery errors are logged.
    pub async fn process_batch(&self) -> Result<usize> {
        let leases = self.queue.claim(self.config.batch_size, self.config.lease_duration).await?;
        let batch_size = leases.len();

        if batch_size > 0 {
            debug!(worker_id = self.id, batch_size, "processing delivery batch");
        }

        for lease in leases {
            self.process_one(lease).await;
        }

        Ok(batch_size)
    }

    async fn process_one(&self, lease: Lease) {
        let delivery_id = lease.delivery_id;
        let outcome = self.dispatcher.process(delivery_id).await;

        match &outcome {
            Ok(_) => self.complete(lease).await,
            Err(error) if is_dangling(error) => {
                warn!(
                    worker_id = self.id,
                    delivery_id = %delivery_id,
                    error = %error,
                    "dropping task for missing delivery"
                );
                self.complete(lease).await;
            },
            Err(error) => {
                error!(
                    worker_id = self.id,
                    delivery_id = %delivery_id,
                    error = %error,
                    retry_in_seconds = self.config.lease_duration.as_secs(),
                    "delivery processing failed, retrying when the lease expires"
                );
            },
        }

        self.stats.write().await.record(&outcome);
    }

    async fn complete(&self, lease: Lease) {
        if let Err(error) = self.queue.complete(lease).await {
            warn!(
                worker_id = self.id,
                delivery_id = %lease.delivery_id,
                error = %error,
                "failed to complete task lease"
            );
        }
    }
}

/// Errors that no retry can fix: the task points at records that do not
/// exist.
fn is_dangling(error: &DeliveryError) -> bool {
    matches!(
        error,
        DeliveryError::DeliveryNotFound { .. } | DeliveryError::SubscriptionNotFound { .. }
    )
}
