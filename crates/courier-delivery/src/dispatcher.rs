//! Delivery orchestration.
//!
//! The dispatcher owns every mutation of a delivery record:
//!
//! ```text
//! enqueue ──▶ record(pending) ──▶ TaskQueue ──▶ process(id)
//!                                                   │
//!                                   load record + subscription
//!                                                   │
//!                         guard: active subscription, attempt allowed
//!                                                   │
//!                 merge metadata ─▶ canonical bytes ─▶ sign ─▶ POST
//!                                                   │
//!                     2xx ─▶ successful      else ─▶ failed
//!                                                   │
//!                              attempts left ─▶ TaskQueue(delay)
//!                              exhausted     ─▶ DeliveryEvent::Exhausted
//! ```
//!
//! Attempt-level failures (transport errors, non-2xx) become record state
//! and never surface as `Err`. `Err` means the attempt could not be run or
//! its outcome could not be persisted.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use courier_core::{
    Clock, CounterField, DeliveryEvent, DeliveryExhaustedEvent, DeliveryFailedEvent, DeliveryId,
    DeliveryRecord, DeliverySucceededEvent, DeliveryStatus, EventHandler, NoOpEventHandler,
    Subscription, SubscriptionId, SubscriptionStatus,
};
use courier_signing::{canonical, codec};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
    queue::{DeliveryTask, TaskQueue},
    retry::{RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Why an attempt did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Subscription is paused or disabled.
    SubscriptionInactive(SubscriptionStatus),
    /// Record is successful, exhausted, or already in flight.
    NotEligible(DeliveryStatus),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscriptionInactive(status) => write!(f, "subscription is {status}"),
            Self::NotEligible(status) => write!(f, "delivery is {status} and cannot be attempted"),
        }
    }
}

/// Result of one call to [`WebhookDispatcher::attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Nothing was sent and the record was not touched.
    Skipped {
        /// Why the attempt did not run
        reason: SkipReason,
    },
    /// Receiver answered 2xx.
    Delivered {
        /// Response status
        status_code: u16,
    },
    /// Attempt failed and a retry was enqueued.
    RetryScheduled {
        /// Attempt number that failed (1-based)
        attempt: u32,
        /// Delay before the retry
        delay: Duration,
    },
    /// Attempt failed and no attempts remain.
    Exhausted {
        /// Total attempts made
        attempts: u32,
    },
}

/// Orchestrates signed delivery attempts and their retries.
#[derive(Clone)]
pub struct WebhookDispatcher {
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn TaskQueue>,
    client: DeliveryClient,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
}

impl WebhookDispatcher {
    /// Creates a dispatcher that discards delivery events.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn TaskQueue>,
        client: DeliveryClient,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            queue,
            client,
            retry_policy,
            clock,
            event_handler: Arc::new(NoOpEventHandler::new()),
        }
    }

    /// Publishes delivery events to `event_handler`.
    #[must_use]
    pub fn with_event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Retry policy in effect.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Creates a pending delivery record and queues its first attempt.
    ///
    /// # Errors
    ///
    /// - `NotSubscribed` if the subscription does not list `event_type`
    /// - `SubscriptionInactive` if the subscription is paused or disabled
    /// - `Storage`/`Queue` if the record or task cannot be persisted
    pub async fn enqueue(
        &self,
        subscription: &Subscription,
        event_type: &str,
        payload: Value,
    ) -> Result<DeliveryId> {
        if !subscription.subscribes_to(event_type) {
            return Err(DeliveryError::NotSubscribed {
                subscription_id: subscription.id,
                event_type: event_type.to_string(),
            });
        }
        if !subscription.is_active() {
            return Err(DeliveryError::SubscriptionInactive {
                subscription_id: subscription.id,
                status: subscription.status,
            });
        }

        let record = DeliveryRecord::new(subscription.id, event_type, payload, self.clock.now());
        let delivery_id = record.id();

        self.storage.create_delivery(record).await?;
        self.queue.enqueue(DeliveryTask::now(delivery_id)).await?;

        info!(
            subscription_id = %subscription.id,
            delivery_id = %delivery_id,
            event_type,
            "delivery enqueued"
        );

        Ok(delivery_id)
    }

    /// Enqueues `payload` for every active subscription listening for
    /// `event_type`.
    ///
    /// A subscription whose enqueue fails is logged and skipped; the others
    /// still receive the event.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the subscriptions cannot be loaded.
    pub async fn broadcast(&self, event_type: &str, payload: Value) -> Result<Vec<DeliveryId>> {
        let subscriptions =
            self.storage.find_subscriptions_for_event(event_type.to_string()).await?;

        let mut delivery_ids = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            match self.enqueue(subscription, event_type, payload.clone()).await {
                Ok(delivery_id) => delivery_ids.push(delivery_id),
                Err(e) => {
                    error!(
                        subscription_id = %subscription.id,
                        event_type,
                        error = %e,
                        "failed to enqueue delivery during broadcast"
                    );
                },
            }
        }

        debug!(
            event_type,
            subscriptions = subscriptions.len(),
            enqueued = delivery_ids.len(),
            "event broadcast"
        );

        Ok(delivery_ids)
    }

    /// Loads a delivery and its subscription and runs one attempt. This is
    /// the entry point for queue workers, which call it while holding the
    /// delivery's queue lease.
    ///
    /// A record found in `processing` belongs to an attempt whose worker lost
    /// its lease before recording the outcome. It is recorded as a failed
    /// attempt and the retry policy decides what follows.
    ///
    /// # Errors
    ///
    /// - `DeliveryNotFound` / `SubscriptionNotFound` for dangling IDs
    /// - any error of [`WebhookDispatcher::attempt`]
    pub async fn process(&self, delivery_id: DeliveryId) -> Result<AttemptOutcome> {
        let record = self
            .storage
            .find_delivery(delivery_id)
            .await?
            .ok_or(DeliveryError::DeliveryNotFound { delivery_id })?;

        let subscription_id = record.subscription_id();
        let subscription = self
            .storage
            .find_subscription(subscription_id)
            .await?
            .ok_or(DeliveryError::SubscriptionNotFound { subscription_id })?;

        if record.status() == DeliveryStatus::Processing {
            return self.recover_interrupted(&subscription, record).await;
        }

        self.attempt(&subscription, record).await
    }

    async fn recover_interrupted(
        &self,
        subscription: &Subscription,
        record: DeliveryRecord,
    ) -> Result<AttemptOutcome> {
        let attempt = record.attempts();

        warn!(
            subscription_id = %subscription.id,
            delivery_id = %record.id(),
            event_type = record.event_type(),
            attempt,
            "delivery attempt was interrupted, recording it as failed"
        );

        self.handle_failure(subscription, record, attempt, DeliveryError::Interrupted { attempt })
            .await
    }

    /// Runs one delivery attempt.
    ///
    /// Not safe to call concurrently for the same record; the task queue
    /// hands each delivery ID to one worker at a time.
    ///
    /// # Errors
    ///
    /// - `Signing` if the subscription secret cannot sign (record untouched)
    /// - `Storage` if the record cannot be persisted
    /// - `Queue` if a retry cannot be scheduled (record stays `failed`)
    pub async fn attempt(
        &self,
        subscription: &Subscription,
        mut record: DeliveryRecord,
    ) -> Result<AttemptOutcome> {
        if !subscription.is_active() {
            let reason = SkipReason::SubscriptionInactive(subscription.status);
            info!(
                subscription_id = %subscription.id,
                delivery_id = %record.id(),
                event_type = record.event_type(),
                %reason,
                "delivery attempt skipped"
            );
            return Ok(AttemptOutcome::Skipped { reason });
        }

        if !record.can_attempt(subscription.max_retries) {
            let reason = SkipReason::NotEligible(record.status());
            debug!(
                subscription_id = %subscription.id,
                delivery_id = %record.id(),
                attempts = record.attempts(),
                %reason,
                "delivery attempt skipped"
            );
            return Ok(AttemptOutcome::Skipped { reason });
        }

        let now = self.clock.now();
        let body = Bytes::from(canonical::to_vec(&enrich_payload(subscription, &record, now))
            .map_err(|e| DeliveryError::Signing { message: e.to_string() })?);
        let signature = codec::sign_bytes(&body, &subscription.secret)?;

        let attempt = record.begin_attempt(subscription.max_retries)?;
        self.storage.save_delivery(record.clone()).await?;

        info!(
            subscription_id = %subscription.id,
            delivery_id = %record.id(),
            event_type = record.event_type(),
            attempt,
            "delivery processing"
        );

        let request = DeliveryRequest {
            delivery_id: record.id(),
            subscription_id: subscription.id,
            url: subscription.url.clone(),
            body,
            signature,
            timestamp: now.timestamp(),
            timeout: subscription.timeout(),
            attempt_number: attempt,
        };

        let result = self.client.deliver(request).await;
        let completed_at = self.clock.now();

        match result {
            Ok(response) if response.is_success => {
                record.mark_successful(response.status_code, response.body, completed_at)?;
                self.storage.save_delivery(record.clone()).await?;
                self.bump_counter(subscription.id, CounterField::Success, completed_at).await;

                info!(
                    subscription_id = %subscription.id,
                    delivery_id = %record.id(),
                    event_type = record.event_type(),
                    status_code = response.status_code,
                    attempt,
                    "delivery successful"
                );

                self.event_handler
                    .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                        delivery_id: record.id(),
                        subscription_id: subscription.id,
                        event_type: record.event_type().to_string(),
                        url: subscription.url.clone(),
                        response_status: response.status_code,
                        attempt_number: attempt,
                        delivered_at: completed_at,
                    }))
                    .await;

                Ok(AttemptOutcome::Delivered { status_code: response.status_code })
            },
            Ok(response) => {
                let failure = DeliveryError::receiver_error(response.status_code, response.body);
                self.handle_failure(subscription, record, attempt, failure).await
            },
            Err(failure) => self.handle_failure(subscription, record, attempt, failure).await,
        }
    }

    async fn handle_failure(
        &self,
        subscription: &Subscription,
        mut record: DeliveryRecord,
        attempt: u32,
        failure: DeliveryError,
    ) -> Result<AttemptOutcome> {
        let failed_at = self.clock.now();
        let status_code = failure.status_code();
        let error_text = match &failure {
            DeliveryError::ReceiverError { body, .. } => body.clone(),
            other => other.to_string(),
        };

        record.mark_failed(status_code, error_text.clone(), failed_at)?;
        self.storage.save_delivery(record.clone()).await?;
        self.bump_counter(subscription.id, CounterField::Failure, failed_at).await;

        warn!(
            subscription_id = %subscription.id,
            delivery_id = %record.id(),
            event_type = record.event_type(),
            status_code,
            attempt,
            error = %failure,
            "delivery failed"
        );

        match self.retry_policy.decide(record.attempts(), subscription.max_retries) {
            RetryDecision::Retry { delay } => {
                self.queue.enqueue(DeliveryTask::delayed(record.id(), delay)).await?;

                info!(
                    subscription_id = %subscription.id,
                    delivery_id = %record.id(),
                    attempt,
                    delay_seconds = delay.as_secs(),
                    "delivery retry scheduled"
                );

                self.event_handler
                    .handle_event(DeliveryEvent::Failed(DeliveryFailedEvent {
                        delivery_id: record.id(),
                        subscription_id: subscription.id,
                        event_type: record.event_type().to_string(),
                        url: subscription.url.clone(),
                        response_status: status_code,
                        attempt_number: attempt,
                        retry_in_seconds: delay.as_secs(),
                        failed_at,
                        error_message: error_text,
                    }))
                    .await;

                Ok(AttemptOutcome::RetryScheduled { attempt, delay })
            },
            RetryDecision::Exhausted => {
                error!(
                    subscription_id = %subscription.id,
                    delivery_id = %record.id(),
                    event_type = record.event_type(),
                    attempts = record.attempts(),
                    "delivery exhausted"
                );

                self.event_handler
                    .handle_event(DeliveryEvent::Exhausted(DeliveryExhaustedEvent {
                        delivery_id: record.id(),
                        subscription_id: subscription.id,
                        event_type: record.event_type().to_string(),
                        url: subscription.url.clone(),
                        response_status: status_code,
                        attempts: record.attempts(),
                        exhausted_at: failed_at,
                        error_message: error_text,
                    }))
                    .await;

                Ok(AttemptOutcome::Exhausted { attempts: record.attempts() })
            },
        }
    }

    async fn bump_counter(
        &self,
        subscription_id: SubscriptionId,
        field: CounterField,
        at: chrono::DateTime<chrono::Utc>,
    ) {
        if let Err(e) = self.storage.increment_counter(subscription_id, field, at).await {
            warn!(
                subscription_id = %subscription_id,
                counter = field.column(),
                error = %e,
                "failed to increment subscription counter"
            );
        }
    }
}

/// Builds the object that is signed and sent: the stored payload with
/// delivery metadata merged in. Metadata keys win over payload keys. A
/// payload that is not a JSON object is nested under `data`.
///
/// The stored payload is cloned, never modified.
pub fn enrich_payload(
    subscription: &Subscription,
    record: &DeliveryRecord,
    now: chrono::DateTime<chrono::Utc>,
) -> Value {
    let mut merged = match record.payload() {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other.clone());
            map
        },
    };

    merged.insert("subscription_id".to_string(), Value::String(subscription.id.to_string()));
    merged.insert("subscription_name".to_string(), Value::String(subscription.name.clone()));
    merged.insert("event".to_string(), Value::String(record.event_type().to_string()));
    merged.insert("delivery_id".to_string(), Value::String(record.id().to_string()));
    merged.insert("timestamp".to_string(), Value::String(now.to_rfc3339()));

    Value::Object(merged)
}
