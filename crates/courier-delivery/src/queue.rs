//! Delayed task queue carrying delivery IDs.
//!
//! The queue is the only hand-off between an attempt and its retry: a task
//! holds nothing but the delivery ID and when it becomes due. Claiming a
//! task leases it: the task stays queued but is hidden from other claims
//! until the lease ends, so one delivery ID is never executed by two workers
//! at once. The worker completes the lease once the attempt's outcome is
//! persisted. A lease that is never completed, because the attempt errored
//! or the worker died, expires and the delivery is claimed again.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{storage::Storage, Clock, DeliveryId};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Request to run a delivery attempt after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTask {
    /// Delivery to attempt.
    pub delivery_id: DeliveryId,
    /// Delay from now before the task becomes due.
    pub delay: Duration,
}

impl DeliveryTask {
    /// A task due immediately.
    pub fn now(delivery_id: DeliveryId) -> Self {
        Self { delivery_id, delay: Duration::ZERO }
    }

    /// A task due after `delay`.
    pub fn delayed(delivery_id: DeliveryId, delay: Duration) -> Self {
        Self { delivery_id, delay }
    }
}

/// A claimed task. Only the holder of the lease can complete it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Delivery to attempt.
    pub delivery_id: DeliveryId,
    /// Identifies this claim; re-enqueueing the delivery invalidates it.
    pub lease_id: Uuid,
}

/// Delayed queue of delivery tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync + std::fmt::Debug {
    /// Schedules a task. Re-enqueueing a delivery replaces its due time and
    /// drops any lease on it.
    async fn enqueue(&self, task: DeliveryTask) -> Result<()>;

    /// Leases up to `max` due tasks for `lease`, earliest first.
    async fn claim(&self, max: usize, lease: Duration) -> Result<Vec<Lease>>;

    /// Removes a leased task. A no-op when the task was re-enqueued after the
    /// claim or the lease was taken over by a later claim.
    async fn complete(&self, lease: Lease) -> Result<()>;
}

fn due_at(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| DeliveryError::queue(format!("delay out of range: {delay:?}")))
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    due_at: DateTime<Utc>,
    lease_id: Option<Uuid>,
}

/// In-process queue driven by the injected clock.
///
/// Used by tests and single-node setups without a database. Every enqueued
/// task is also recorded so tests can assert on the retry schedule.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    clock: Arc<dyn Clock>,
    tasks: Mutex<HashMap<DeliveryId, Slot>>,
    history: Mutex<Vec<DeliveryTask>>,
    enqueue_error: Mutex<Option<String>>,
}

impl InMemoryTaskQueue {
    /// Creates an empty queue.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            enqueue_error: Mutex::new(None),
        }
    }

    /// Every task ever enqueued, in order.
    pub async fn enqueued(&self) -> Vec<DeliveryTask> {
        self.history.lock().await.clone()
    }

    /// Tasks enqueued for one delivery, in order.
    pub async fn enqueued_for(&self, delivery_id: DeliveryId) -> Vec<DeliveryTask> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|task| task.delivery_id == delivery_id)
            .copied()
            .collect()
    }

    /// Number of queued tasks, due, leased or not.
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Whether no task is queued.
    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    /// When a delivery next becomes claimable, if it is queued at all. For a
    /// leased task this is the end of the lease.
    pub async fn due_at(&self, delivery_id: DeliveryId) -> Option<DateTime<Utc>> {
        self.tasks.lock().await.get(&delivery_id).map(|slot| slot.due_at)
    }

    /// Whether a delivery is currently held by a worker.
    pub async fn is_leased(&self, delivery_id: DeliveryId) -> bool {
        self.tasks.lock().await.get(&delivery_id).is_some_and(|slot| slot.lease_id.is_some())
    }

    /// Makes the next `enqueue` fail with `message`.
    pub async fn fail_next_enqueue(&self, message: impl Into<String>) {
        *self.enqueue_error.lock().await = Some(message.into());
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: DeliveryTask) -> Result<()> {
        if let Some(message) = self.enqueue_error.lock().await.take() {
            return Err(DeliveryError::queue(message));
        }

        let due = due_at(self.clock.now(), task.delay)?;
        self.tasks.lock().await.insert(task.delivery_id, Slot { due_at: due, lease_id: None });
        self.history.lock().await.push(task);
        Ok(())
    }

    async fn claim(&self, max: usize, lease: Duration) -> Result<Vec<Lease>> {
        let now = self.clock.now();
        let lease_until = due_at(now, lease)?;
        let lease_id = Uuid::new_v4();
        let mut tasks = self.tasks.lock().await;

        let mut due: Vec<_> = tasks
            .iter()
            .filter(|(_, slot)| slot.due_at <= now)
            .map(|(id, slot)| (slot.due_at, *id))
            .collect();
        due.sort_unstable();
        due.truncate(max);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, delivery_id) in due {
            tasks.insert(delivery_id, Slot { due_at: lease_until, lease_id: Some(lease_id) });
            claimed.push(Lease { delivery_id, lease_id });
        }

        Ok(claimed)
    }

    async fn complete(&self, lease: Lease) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.get(&lease.delivery_id).is_some_and(|slot| slot.lease_id == Some(lease.lease_id))
        {
            tasks.remove(&lease.delivery_id);
        }
        Ok(())
    }
}

/// Queue backed by the `delivery_tasks` table.
#[derive(Clone)]
pub struct PostgresTaskQueue {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresTaskQueue {
    /// Creates a queue over the shared storage.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl std::fmt::Debug for PostgresTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTaskQueue").finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskQueue for PostgresTaskQueue {
    async fn enqueue(&self, task: DeliveryTask) -> Result<()> {
        let due = due_at(self.clock.now(), task.delay)?;
        self.storage
            .delivery_tasks
            .schedule(task.delivery_id, due)
            .await
            .map_err(|e| DeliveryError::queue(e.to_string()))
    }

    async fn claim(&self, max: usize, lease: Duration) -> Result<Vec<Lease>> {
        let now = self.clock.now();
        let lease_until = due_at(now, lease)?;
        let lease_id = Uuid::new_v4();

        let ids = self
            .storage
            .delivery_tasks
            .claim_due(now, lease_until, lease_id, max)
            .await
            .map_err(|e| DeliveryError::queue(e.to_string()))?;

        Ok(ids.into_iter().map(|delivery_id| Lease { delivery_id, lease_id }).collect())
    }

    async fn complete(&self, lease: Lease) -> Result<()> {
        self.storage
            .delivery_tasks
            .complete(lease.delivery_id, lease.lease_id)
            .await
            .map(|_| ())
            .map_err(|e| DeliveryError::queue(e.to_string()))
    }
}
