//! Repository for scheduled delivery tasks.
//!
//! A task is a delivery ID and the earliest time it may run. Claiming does
//! not delete the row: it pushes `due_at` to the end of the lease and stamps
//! a `lease_id`, selecting rows `FOR UPDATE SKIP LOCKED` so concurrent
//! workers never receive the same task. The row is deleted only by
//! [`Repository::complete`] with the matching lease, so a worker that fails
//! or dies mid-attempt leaves the task to reappear when the lease ends.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{error::Result, models::DeliveryId};

/// Repository for scheduled delivery tasks.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Schedules a delivery, replacing any earlier schedule or lease for the
    /// same ID.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn schedule(&self, delivery_id: DeliveryId, due_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO delivery_tasks (delivery_id, due_at, lease_id)
            VALUES ($1, $2, NULL)
            ON CONFLICT (delivery_id) DO UPDATE SET due_at = EXCLUDED.due_at, lease_id = NULL
            ",
        )
        .bind(delivery_id)
        .bind(due_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Leases up to `limit` tasks due at or before `now`, oldest first. The
    /// leased rows stay hidden until `lease_until`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        lease_id: Uuid,
        limit: usize,
    ) -> Result<Vec<DeliveryId>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let ids = sqlx::query_scalar::<_, DeliveryId>(
            r"
            UPDATE delivery_tasks
            SET due_at = $2, lease_id = $3
            WHERE delivery_id IN (
                SELECT delivery_id
                FROM delivery_tasks
                WHERE due_at <= $1
                ORDER BY due_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING delivery_id
            ",
        )
        .bind(now)
        .bind(lease_until)
        .bind(lease_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }

    /// Deletes a task if it is still held under `lease_id`. A task that was
    /// rescheduled since the claim is left alone. Returns whether a row was
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn complete(&self, delivery_id: DeliveryId, lease_id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM delivery_tasks WHERE delivery_id = $1 AND lease_id = $2")
                .bind(delivery_id)
                .bind(lease_id)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Number of scheduled tasks, due, leased or not.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM delivery_tasks").fetch_one(&*self.pool).await?;

        Ok(count)
    }
}
