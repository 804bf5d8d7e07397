//! Repository for subscription database operations.
//!
//! Subscriptions carry the signing secrets, the rotation grace period, and
//! the success/failure counters updated after every delivery attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{to_i32, to_i64};
use crate::{
    error::{CoreError, Result},
    models::{CounterField, Subscription, SubscriptionId},
};

const SELECT_COLUMNS: &str = r"
    SELECT id, name, url, secret, previous_secret, secret_rotated_at,
           previous_secret_expires_at, event_types, status, timeout_seconds,
           max_retries, success_count, failure_count, last_triggered_at,
           created_at, updated_at
    FROM subscriptions
";

/// Repository for subscription database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or a constraint is violated.
    pub async fn create(&self, subscription: &Subscription) -> Result<SubscriptionId> {
        let id = sqlx::query_scalar::<_, SubscriptionId>(
            r"
            INSERT INTO subscriptions (
                id, name, url, secret, previous_secret, secret_rotated_at,
                previous_secret_expires_at, event_types, status, timeout_seconds,
                max_retries, success_count, failure_count, last_triggered_at,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16
            )
            RETURNING id
            ",
        )
        .bind(subscription.id)
        .bind(&subscription.name)
        .bind(&subscription.url)
        .bind(&subscription.secret)
        .bind(&subscription.previous_secret)
        .bind(subscription.secret_rotated_at)
        .bind(subscription.previous_secret_expires_at)
        .bind(&subscription.event_types)
        .bind(subscription.status.as_str())
        .bind(to_i32(subscription.timeout_seconds, "timeout_seconds")?)
        .bind(to_i32(subscription.max_retries, "max_retries")?)
        .bind(to_i64(subscription.success_count, "success_count")?)
        .bind(to_i64(subscription.failure_count, "failure_count")?)
        .bind(subscription.last_triggered_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds a subscription by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let subscription =
            sqlx::query_as::<_, Subscription>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(subscription)
    }

    /// Finds active subscriptions whose event types contain `event_type`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active_for_event(&self, event_type: &str) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "{SELECT_COLUMNS} WHERE status = 'active' AND $1 = ANY(event_types) ORDER BY created_at"
        ))
        .bind(event_type)
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Finds subscriptions still holding a previous secret.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_with_previous_secret(&self) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "{SELECT_COLUMNS} WHERE previous_secret IS NOT NULL"
        ))
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Persists configuration and secret fields of an existing subscription.
    ///
    /// Counters are left alone; they only move through `increment_counter`
    /// so concurrent attempts never overwrite each other's increments.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no row matches the ID.
    pub async fn update(&self, subscription: &Subscription) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE subscriptions
            SET name = $2,
                url = $3,
                secret = $4,
                previous_secret = $5,
                secret_rotated_at = $6,
                previous_secret_expires_at = $7,
                event_types = $8,
                status = $9,
                timeout_seconds = $10,
                max_retries = $11,
                updated_at = $12
            WHERE id = $1
            ",
        )
        .bind(subscription.id)
        .bind(&subscription.name)
        .bind(&subscription.url)
        .bind(&subscription.secret)
        .bind(&subscription.previous_secret)
        .bind(subscription.secret_rotated_at)
        .bind(subscription.previous_secret_expires_at)
        .bind(&subscription.event_types)
        .bind(subscription.status.as_str())
        .bind(to_i32(subscription.timeout_seconds, "timeout_seconds")?)
        .bind(to_i32(subscription.max_retries, "max_retries")?)
        .bind(subscription.updated_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("subscription {}", subscription.id)));
        }

        Ok(())
    }

    /// Clears the previous secret if its grace period ended before `now`.
    ///
    /// Only the previous-secret columns are written, and only while the
    /// stored expiry is still in the past, so a concurrent rotation or
    /// status change is never overwritten. Returns whether a row changed.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn clear_expired_previous_secret(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE subscriptions
            SET previous_secret = NULL,
                previous_secret_expires_at = NULL,
                updated_at = $2
            WHERE id = $1
              AND previous_secret IS NOT NULL
              AND previous_secret_expires_at < $2
            ",
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically increments a counter and stamps `last_triggered_at`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no row matches the ID.
    pub async fn increment_counter(
        &self,
        id: SubscriptionId,
        field: CounterField,
        triggered_at: DateTime<Utc>,
    ) -> Result<()> {
        let column = field.column();
        let sql = format!(
            "UPDATE subscriptions SET {column} = {column} + 1, last_triggered_at = $2 WHERE id = $1"
        );

        let result = sqlx::query(&sql).bind(id).bind(triggered_at).execute(&*self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("subscription {id}")));
        }

        Ok(())
    }
}
