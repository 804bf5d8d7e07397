//! Delivery outcome events for operator channels.
//!
//! The dispatcher reports every finished attempt through an injected
//! `EventHandler`. Handlers observe outcomes, they never influence them:
//! an exhausted delivery is surfaced here and nowhere else.
//!
//! ```text
//! ┌────────────┐  Succeeded/Failed/Exhausted  ┌────────────────────┐
//! │ Dispatcher │ ────────────────────────────▶│ MulticastHandler   │
//! └────────────┘                              └────────────────────┘
//!                                                    │
//!                                     ┌──────────────┴─────────────┐
//!                                     ▼                            ▼
//!                              ┌─────────────┐             ┌──────────────┐
//!                              │ log / alert │             │ test recorder│
//!                              └─────────────┘             └──────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DeliveryId, SubscriptionId};

/// Events emitted by the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// Receiver answered 2xx.
    Succeeded(DeliverySucceededEvent),

    /// Attempt failed, another attempt has been scheduled.
    Failed(DeliveryFailedEvent),

    /// Attempt failed and no attempts remain.
    Exhausted(DeliveryExhaustedEvent),
}

impl DeliveryEvent {
    /// Delivery the event refers to.
    pub fn delivery_id(&self) -> DeliveryId {
        match self {
            Self::Succeeded(event) => event.delivery_id,
            Self::Failed(event) => event.delivery_id,
            Self::Exhausted(event) => event.delivery_id,
        }
    }
}

/// Emitted when a delivery succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Delivered record.
    pub delivery_id: DeliveryId,

    /// Subscription that received the webhook.
    pub subscription_id: SubscriptionId,

    /// Event type that was delivered.
    pub event_type: String,

    /// Receiver URL.
    pub url: String,

    /// HTTP status returned by the receiver.
    pub response_status: u16,

    /// Attempt number that succeeded (1-based).
    pub attempt_number: u32,

    /// When the successful attempt completed.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when an attempt fails and a retry is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Failed record.
    pub delivery_id: DeliveryId,

    /// Subscription the delivery belongs to.
    pub subscription_id: SubscriptionId,

    /// Event type of the delivery.
    pub event_type: String,

    /// Receiver URL.
    pub url: String,

    /// HTTP status if the receiver responded.
    pub response_status: Option<u16>,

    /// Attempt number that failed (1-based).
    pub attempt_number: u32,

    /// Delay before the next attempt, in seconds.
    pub retry_in_seconds: u64,

    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,

    /// Transport error or truncated response body.
    pub error_message: String,
}

/// Emitted once per delivery when its last permitted attempt fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryExhaustedEvent {
    /// Exhausted record.
    pub delivery_id: DeliveryId,

    /// Subscription the delivery belongs to.
    pub subscription_id: SubscriptionId,

    /// Event type of the delivery.
    pub event_type: String,

    /// Receiver URL.
    pub url: String,

    /// HTTP status of the final attempt if the receiver responded.
    pub response_status: Option<u16>,

    /// Total attempts made.
    pub attempts: u32,

    /// When the final attempt failed.
    pub exhausted_at: DateTime<Utc>,

    /// Error of the final attempt.
    pub error_message: String,
}

/// Receiver of delivery events.
///
/// `handle_event` runs inline with delivery processing, so implementations
/// should return quickly and must not fail the delivery: errors are logged
/// by the handler itself.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// No-op event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards every event to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber to receive delivery events.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}
