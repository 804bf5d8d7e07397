//! PostgreSQL repositories for subscriptions, delivery records and the
//! delivery task queue.
//!
//! All SQL lives in this module. Other crates reach the database through
//! these repositories or the traits built on top of them.

use std::sync::Arc;

use sqlx::PgPool;

pub mod deliveries;
pub mod delivery_tasks;
pub mod subscriptions;

use crate::error::{CoreError, Result};

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for subscription configuration and counters.
    pub subscriptions: Arc<subscriptions::Repository>,

    /// Repository for delivery records.
    pub deliveries: Arc<deliveries::Repository>,

    /// Repository for scheduled delivery tasks.
    pub delivery_tasks: Arc<delivery_tasks::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            subscriptions: Arc::new(subscriptions::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            delivery_tasks: Arc::new(delivery_tasks::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies database connectivity. Backs the `/ready` endpoint.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

/// Converts an unsigned domain value to the INTEGER column type.
pub(crate) fn to_i32(value: u32, column: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| CoreError::InvalidInput(format!("{column} exceeds INTEGER range: {value}")))
}

/// Converts an unsigned counter to the BIGINT column type.
pub(crate) fn to_i64(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| CoreError::InvalidInput(format!("{column} exceeds BIGINT range: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }

    #[test]
    fn oversized_values_are_rejected() {
        assert!(matches!(to_i32(u32::MAX, "max_retries"), Err(CoreError::InvalidInput(_))));
        assert_eq!(to_i32(3, "max_retries").unwrap(), 3);
        assert!(to_i64(u64::MAX, "success_count").is_err());
    }
}
