//! Operator surfacing of delivery outcomes.

use async_trait::async_trait;
use courier_core::{DeliveryEvent, EventHandler};
use tracing::{debug, error};

/// Logs exhausted deliveries at `error` so they reach whoever watches the
/// service logs. Other outcomes are logged at `debug`.
#[derive(Debug, Default)]
pub struct ExhaustionAlerts;

#[async_trait]
impl EventHandler for ExhaustionAlerts {
    async fn handle_event(&self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::Exhausted(event) => {
                error!(
                    delivery_id = %event.delivery_id,
                    subscription_id = %event.subscription_id,
                    event_type = %event.event_type,
                    url = %event.url,
                    attempts = event.attempts,
                    response_status = ?event.response_status,
                    error = %event.error_message,
                    "webhook delivery exhausted, operator attention required"
                );
            },
            DeliveryEvent::Failed(event) => {
                debug!(
                    delivery_id = %event.delivery_id,
                    attempt = event.attempt_number,
                    retry_in_seconds = event.retry_in_seconds,
                    "webhook delivery failed, retry scheduled"
                );
            },
            DeliveryEvent::Succeeded(event) => {
                debug!(
                    delivery_id = %event.delivery_id,
                    attempt = event.attempt_number,
                    status_code = event.response_status,
                    "webhook delivered"
                );
            },
        }
    }
}
