//! Storage abstraction for the delivery engine.
//!
//! The dispatcher, worker pool and rotation sweeper only see this trait.
//! Production uses `PostgresDeliveryStorage` over the core repositories;
//! tests use `mock::MockDeliveryStorage`.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result, storage::Storage, CounterField, DeliveryId, DeliveryRecord, Subscription,
    SubscriptionId,
};

/// Persistence operations required by the delivery engine.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Loads a subscription by ID.
    fn find_subscription(
        &self,
        id: SubscriptionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Subscription>>> + Send + '_>>;

    /// Persists configuration and secret fields. Counters are not written.
    fn save_subscription(
        &self,
        subscription: Subscription,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Active subscriptions listening for `event_type`.
    fn find_subscriptions_for_event(
        &self,
        event_type: String,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Subscription>>> + Send + '_>>;

    /// Subscriptions currently holding a previous secret.
    fn find_subscriptions_with_previous_secret(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Subscription>>> + Send + '_>>;

    /// Clears the previous secret of a subscription if it expired before
    /// `now`, leaving every other field alone. Returns whether it was
    /// cleared.
    fn clear_expired_previous_secret(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Loads a delivery record by ID.
    fn find_delivery(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>>;

    /// Inserts a new delivery record.
    fn create_delivery(
        &self,
        record: DeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Persists the mutable state of a delivery record.
    fn save_delivery(
        &self,
        record: DeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Atomically increments a subscription counter and stamps
    /// `last_triggered_at`.
    fn increment_counter(
        &self,
        id: SubscriptionId,
        field: CounterField,
        triggered_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// PostgreSQL implementation over the core repositories.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_subscription(
        &self,
        id: SubscriptionId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Subscription>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.find_by_id(id).await })
    }

    fn save_subscription(
        &self,
        subscription: Subscription,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.update(&subscription).await })
    }

    fn find_subscriptions_for_event(
        &self,
        event_type: String,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Subscription>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.find_active_for_event(&event_type).await })
    }

    fn find_subscriptions_with_previous_secret(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Subscription>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.find_with_previous_secret().await })
    }

    fn clear_expired_previous_secret(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscriptions.clear_expired_previous_secret(id, now).await })
    }

    fn find_delivery(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.find_by_id(id).await })
    }

    fn create_delivery(
        &self,
        record: DeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.create(&record).await.map(|_| ()) })
    }

    fn save_delivery(
        &self,
        record: DeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.update(&record).await })
    }

    fn increment_counter(
        &self,
        id: SubscriptionId,
        field: CounterField,
        triggered_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.subscriptions.increment_counter(id, field, triggered_at).await
        })
    }
}

pub mod mock {
    //! In-memory storage for testing delivery logic without a database.
    //!
    //! Mirrors the PostgreSQL semantics the engine relies on: saving a
    //! subscription leaves its counters alone, and a delivery can only be
    //! created for a known subscription.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use courier_core::{error::Result, CoreError};
    use tokio::sync::RwLock;

    use super::{
        CounterField, DeliveryId, DeliveryRecord, DeliveryStorage, Subscription, SubscriptionId,
    };

    /// Storage operations that can be made to fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Operation {
        /// `find_subscription`
        FindSubscription,
        /// `save_subscription`
        SaveSubscription,
        /// `find_subscriptions_for_event`
        FindSubscriptionsForEvent,
        /// `clear_expired_previous_secret`
        ClearPreviousSecret,
        /// `find_delivery`
        FindDelivery,
        /// `create_delivery`
        CreateDelivery,
        /// `save_delivery`
        SaveDelivery,
        /// `increment_counter`
        IncrementCounter,
    }

    /// Mock storage with one-shot error injection per operation.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        subscriptions: Arc<RwLock<HashMap<SubscriptionId, Subscription>>>,
        deliveries: Arc<RwLock<HashMap<DeliveryId, DeliveryRecord>>>,
        injected_errors: Arc<RwLock<HashMap<Operation, String>>>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a subscription.
        pub async fn add_subscription(&self, subscription: Subscription) {
            self.subscriptions.write().await.insert(subscription.id, subscription);
        }

        /// Inserts a delivery record directly, bypassing the dispatcher.
        pub async fn add_delivery(&self, record: DeliveryRecord) {
            self.deliveries.write().await.insert(record.id(), record);
        }

        /// Current state of a subscription.
        pub async fn subscription(&self, id: SubscriptionId) -> Option<Subscription> {
            self.subscriptions.read().await.get(&id).cloned()
        }

        /// Current state of a delivery record.
        pub async fn delivery(&self, id: DeliveryId) -> Option<DeliveryRecord> {
            self.deliveries.read().await.get(&id).cloned()
        }

        /// All delivery records of a subscription.
        pub async fn deliveries_for(&self, id: SubscriptionId) -> Vec<DeliveryRecord> {
            self.deliveries
                .read()
                .await
                .values()
                .filter(|record| record.subscription_id() == id)
                .cloned()
                .collect()
        }

        /// Makes the next call of `operation` fail with `message`.
        pub async fn inject_error(&self, operation: Operation, message: impl Into<String>) {
            self.injected_errors.write().await.insert(operation, message.into());
        }

        async fn take_error(&self, operation: Operation) -> Result<()> {
            match self.injected_errors.write().await.remove(&operation) {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_subscription(
            &self,
            id: SubscriptionId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Subscription>>> + Send + '_>> {
            Box::pin(async move {
                self.take_error(Operation::FindSubscription).await?;
                Ok(self.subscription(id).await)
            })
        }

        fn save_subscription(
            &self,
            subscription: Subscription,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.take_error(Operation::SaveSubscription).await?;

                let mut subscriptions = self.subscriptions.write().await;
                let stored = subscriptions.get_mut(&subscription.id).ok_or_else(|| {
                    CoreError::NotFound(format!("subscription {}", subscription.id))
                })?;

                let Subscription { success_count, failure_count, last_triggered_at, .. } = *stored;
                *stored = Subscription {
                    success_count,
                    failure_count,
                    last_triggered_at,
                    ..subscription
                };
                Ok(())
            })
        }

        fn find_subscriptions_for_event(
            &self,
            event_type: String,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Subscription>>> + Send + '_>> {
            Box::pin(async move {
                self.take_error(Operation::FindSubscriptionsForEvent).await?;

                let mut matching: Vec<_> = self
                    .subscriptions
                    .read()
                    .await
                    .values()
                    .filter(|sub| sub.is_active() && sub.subscribes_to(&event_type))
                    .cloned()
                    .collect();
                matching.sort_by_key(|sub| sub.created_at);
                Ok(matching)
            })
        }

        fn find_subscriptions_with_previous_secret(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Subscription>>> + Send + '_>> {
            Box::pin(async move {
                Ok(self
                    .subscriptions
                    .read()
                    .await
                    .values()
                    .filter(|sub| sub.previous_secret.is_some())
                    .cloned()
                    .collect())
            })
        }

        fn clear_expired_previous_secret(
            &self,
            id: SubscriptionId,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                self.take_error(Operation::ClearPreviousSecret).await?;

                let mut subscriptions = self.subscriptions.write().await;
                let Some(sub) = subscriptions.get_mut(&id) else {
                    return Ok(false);
                };

                let expired = sub.previous_secret.is_some()
                    && sub.previous_secret_expires_at.is_some_and(|expires_at| expires_at < now);
                if expired {
                    sub.previous_secret = None;
                    sub.previous_secret_expires_at = None;
                    sub.updated_at = now;
                }
                Ok(expired)
            })
        }

        fn find_delivery(
            &self,
            id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>> {
            Box::pin(async move {
                self.take_error(Operation::FindDelivery).await?;
                Ok(self.delivery(id).await)
            })
        }

        fn create_delivery(
            &self,
            record: DeliveryRecord,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.take_error(Operation::CreateDelivery).await?;

                if !self.subscriptions.read().await.contains_key(&record.subscription_id()) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "foreign key constraint violation: subscription {} does not exist",
                        record.subscription_id()
                    )));
                }

                let mut deliveries = self.deliveries.write().await;
                if deliveries.contains_key(&record.id()) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "unique constraint violation: delivery {}",
                        record.id()
                    )));
                }
                deliveries.insert(record.id(), record);
                Ok(())
            })
        }

        fn save_delivery(
            &self,
            record: DeliveryRecord,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.take_error(Operation::SaveDelivery).await?;

                let mut deliveries = self.deliveries.write().await;
                let stored = deliveries
                    .get_mut(&record.id())
                    .ok_or_else(|| CoreError::NotFound(format!("delivery {}", record.id())))?;
                *stored = record;
                Ok(())
            })
        }

        fn increment_counter(
            &self,
            id: SubscriptionId,
            field: CounterField,
            triggered_at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.take_error(Operation::IncrementCounter).await?;

                let mut subscriptions = self.subscriptions.write().await;
                let sub = subscriptions
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))?;

                match field {
                    CounterField::Success => sub.success_count += 1,
                    CounterField::Failure => sub.failure_count += 1,
                }
                sub.last_triggered_at = Some(triggered_at);
                Ok(())
            })
        }
    }
}
