//! Signed webhook delivery with bounded retries.
//!
//! The [`WebhookDispatcher`] turns an event into a pending delivery record,
//! and a [`WorkerPool`] drains the [`TaskQueue`] by running one dispatcher
//! attempt per claimed delivery:
//!
//! 1. **Enqueue** - record created as `pending`, task due immediately
//! 2. **Claim** - a worker leases due tasks from the queue
//! 3. **Attempt** - payload enriched, canonicalized, signed and POSTed
//! 4. **Outcome** - record marked `successful` or `failed`; failures are
//!    re-enqueued with exponential backoff until `max_retries` attempts
//! 5. **Complete** - the lease is released once the outcome is persisted; an
//!    attempt that errored keeps its lease and is claimed again when it ends
//!
//! Persistence goes through [`DeliveryStorage`] so the engine runs against
//! PostgreSQL in production and [`storage::mock::MockDeliveryStorage`] in
//! tests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{Clock, RealClock};
//! use courier_delivery::{
//!     storage::mock::MockDeliveryStorage, DeliveryClient, InMemoryTaskQueue, RetryPolicy,
//!     WebhookDispatcher, WorkerConfig, WorkerPool,
//! };
//!
//! # async fn example() -> courier_delivery::Result<()> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let queue = Arc::new(InMemoryTaskQueue::new(clock.clone()));
//! let dispatcher = WebhookDispatcher::new(
//!     Arc::new(MockDeliveryStorage::new()),
//!     queue.clone(),
//!     DeliveryClient::with_defaults()?,
//!     RetryPolicy::default(),
//!     clock.clone(),
//! );
//!
//! let mut pool = WorkerPool::new(dispatcher, queue, WorkerConfig::default(), clock);
//! pool.spawn_workers().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod sweeper;
pub mod worker;
pub mod worker_pool;

pub use client::{ClientConfig, DeliveryClient};
pub use dispatcher::{AttemptOutcome, SkipReason, WebhookDispatcher};
pub use error::{DeliveryError, Result};
pub use queue::{DeliveryTask, InMemoryTaskQueue, Lease, PostgresTaskQueue, TaskQueue};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use sweeper::RotationSweeper;
pub use worker::{DeliveryWorker, EngineStats, WorkerConfig};
pub use worker_pool::WorkerPool;

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default number of tasks claimed per worker batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default time a claimed task stays hidden from other workers.
pub const DEFAULT_LEASE_DURATION: std::time::Duration = std::time::Duration::from_secs(300);
