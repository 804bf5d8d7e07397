//! Repository for delivery record operations.

use std::sync::Arc;

use sqlx::PgPool;

use super::to_i32;
use crate::{
    error::{CoreError, Result},
    models::{DeliveryId, DeliveryRecord},
};

/// Repository for delivery record operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a freshly created delivery record.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails, e.g. the subscription does not
    /// exist.
    pub async fn create(&self, record: &DeliveryRecord) -> Result<DeliveryId> {
        let id = sqlx::query_scalar::<_, DeliveryId>(
            r"
            INSERT INTO deliveries (
                id, subscription_id, event_type, payload, status, attempts,
                response_code, response_body, created_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            ",
        )
        .bind(record.id())
        .bind(record.subscription_id())
        .bind(record.event_type())
        .bind(sqlx::types::Json(record.payload()))
        .bind(record.status().as_str())
        .bind(to_i32(record.attempts(), "attempts")?)
        .bind(record.response_code().map(i32::from))
        .bind(record.response_body())
        .bind(record.created_at())
        .bind(record.completed_at())
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds a delivery record by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            r"
            SELECT id, subscription_id, event_type, payload, status, attempts,
                   response_code, response_body, created_at, completed_at
            FROM deliveries
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Persists the mutable state of a record. The payload column is never
    /// written after insert.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no row matches the ID.
    pub async fn update(&self, record: &DeliveryRecord) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE deliveries
            SET status = $2,
                attempts = $3,
                response_code = $4,
                response_body = $5,
                completed_at = $6
            WHERE id = $1
            ",
        )
        .bind(record.id())
        .bind(record.status().as_str())
        .bind(to_i32(record.attempts(), "attempts")?)
        .bind(record.response_code().map(i32::from))
        .bind(record.response_body())
        .bind(record.completed_at())
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("delivery {}", record.id())));
        }

        Ok(())
    }
}
