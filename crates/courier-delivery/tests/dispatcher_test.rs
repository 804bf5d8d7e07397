//! Integration tests for the webhook dispatcher.
//!
//! Each test wires the dispatcher to in-memory storage, an in-memory task
//! queue, a test clock and a wiremock receiver, then drives attempts by
//! hand through `process`.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use courier_core::{
    Clock, DeliveryEvent, DeliveryId, DeliveryRecord, DeliveryStatus, EventHandler, SigningSecret,
    Subscription, SubscriptionStatus, TestClock,
};
use courier_delivery::{
    client::{SIGNATURE_HEADER, TIMESTAMP_HEADER, WEBHOOK_ID_HEADER},
    storage::mock::{MockDeliveryStorage, Operation},
    AttemptOutcome, DeliveryClient, DeliveryError, InMemoryTaskQueue, RetryPolicy, SkipReason,
    WebhookDispatcher,
};
use courier_signing::codec;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

#[derive(Debug, Default)]
struct RecordingHandler {
    events: Mutex<Vec<DeliveryEvent>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.lock().await.push(event);
    }
}

struct Harness {
    clock: TestClock,
    storage: MockDeliveryStorage,
    queue: Arc<InMemoryTaskQueue>,
    events: Arc<RecordingHandler>,
    dispatcher: WebhookDispatcher,
    server: MockServer,
}

impl Harness {
    async fn new() -> Self {
        let clock = TestClock::new();
        let storage = MockDeliveryStorage::new();
        let queue = Arc::new(InMemoryTaskQueue::new(Arc::new(clock.clone())));
        let events = Arc::new(RecordingHandler::default());

        let dispatcher = WebhookDispatcher::new(
            Arc::new(storage.clone()),
            queue.clone(),
            DeliveryClient::with_defaults().expect("client builds"),
            RetryPolicy::default(),
            Arc::new(clock.clone()),
        )
        .with_event_handler(events.clone());

        Self { clock, storage, queue, events, dispatcher, server: MockServer::start().await }
    }

    async fn subscription(&self, event_types: &[&str]) -> Subscription {
        let sub = Subscription::new(
            "crm",
            format!("{}/hook", self.server.uri()),
            SigningSecret::from("s3cr3t"),
            event_types.iter().map(ToString::to_string).collect(),
            self.clock.now(),
        );
        self.storage.add_subscription(sub.clone()).await;
        sub
    }

    async fn respond_with(&self, status: u16) {
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(status).set_body_string(format!("status {status}")))
            .mount(&self.server)
            .await;
    }

    async fn record(&self, id: DeliveryId) -> DeliveryRecord {
        self.storage.delivery(id).await.expect("delivery exists")
    }
}

/// A 2xx response marks the record successful and bumps the success counter.
#[tokio::test]
async fn successful_delivery_marks_record_successful() -> Result<()> {
    let h = Harness::new().await;
    h.respond_with(200).await;
    let sub = h.subscription(&["user.created"]).await;

    let id = h.dispatcher.enqueue(&sub, "user.created", json!({"user_id": "u1"})).await?;
    assert_eq!(h.record(id).await.status(), DeliveryStatus::Pending);

    let outcome = h.dispatcher.process(id).await?;
    assert_eq!(outcome, AttemptOutcome::Delivered { status_code: 200 });

    let record = h.record(id).await;
    assert_eq!(record.status(), DeliveryStatus::Successful);
    assert_eq!(record.attempts(), 1);
    assert_eq!(record.response_code(), Some(200));
    assert_eq!(record.response_body(), Some("status 200"));
    assert!(record.completed_at().is_some());

    let stored = h.storage.subscription(sub.id).await.expect("subscription exists");
    assert_eq!(stored.success_count, 1);
    assert_eq!(stored.failure_count, 0);
    assert!(stored.last_triggered_at.is_some());

    assert!(matches!(h.events.events.lock().await.as_slice(), [DeliveryEvent::Succeeded(_)]));
    Ok(())
}

/// The receiver can verify the signature from the headers and parsed body.
#[tokio::test]
async fn receiver_can_verify_signature() -> Result<()> {
    let h = Harness::new().await;
    h.respond_with(200).await;
    let sub = h.subscription(&["user.created"]).await;

    let id = h.dispatcher.enqueue(&sub, "user.created", json!({"user_id": "u1", "n": 7})).await?;
    h.dispatcher.process(id).await?;

    let requests = h.server.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let signature = request.headers.get(SIGNATURE_HEADER).expect("signature header").to_str()?;
    let timestamp = request.headers.get(TIMESTAMP_HEADER).expect("timestamp header").to_str()?;
    let webhook_id = request.headers.get(WEBHOOK_ID_HEADER).expect("id header").to_str()?;

    assert_eq!(signature.len(), codec::SIGNATURE_HEX_LEN);
    assert_eq!(timestamp, h.clock.now().timestamp().to_string());
    assert_eq!(webhook_id, sub.id.to_string());

    let body: Value = serde_json::from_slice(&request.body)?;
    assert!(codec::verify(&body, signature, &SigningSecret::from("s3cr3t")));
    assert!(!codec::verify(&body, signature, &SigningSecret::from("wrong")));

    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["event"], "user.created");
    assert_eq!(body["delivery_id"], id.to_string());
    assert_eq!(body["subscription_id"], sub.id.to_string());

    // Stored payload is not modified by enrichment.
    assert_eq!(h.record(id).await.payload(), &json!({"user_id": "u1", "n": 7}));
    Ok(())
}

/// With `max_retries = 3` a permanently failing receiver sees exactly three
/// attempts and the record ends failed.
#[tokio::test]
async fn failing_receiver_is_retried_until_exhausted() -> Result<()> {
    let h = Harness::new().await;
    h.respond_with(500).await;
    let sub = h.subscription(&["user.created"]).await.with_max_retries(3);
    h.storage.add_subscription(sub.clone()).await;

    let id = h.dispatcher.enqueue(&sub, "user.created", json!({})).await?;

    assert_eq!(
        h.dispatcher.process(id).await?,
        AttemptOutcome::RetryScheduled { attempt: 1, delay: Duration::from_secs(60) }
    );
    assert_eq!(h.record(id).await.status(), DeliveryStatus::Failed);

    assert_eq!(
        h.dispatcher.process(id).await?,
        AttemptOutcome::RetryScheduled { attempt: 2, delay: Duration::from_secs(120) }
    );
    assert_eq!(h.dispatcher.process(id).await?, AttemptOutcome::Exhausted { attempts: 3 });

    let record = h.record(id).await;
    assert_eq!(record.status(), DeliveryStatus::Failed);
    assert_eq!(record.attempts(), 3);
    assert_eq!(record.response_code(), Some(500));

    // Initial task plus two retries; nothing after exhaustion.
    let tasks = h.queue.enqueued_for(id).await;
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[1].delay, Duration::from_secs(60));
    assert_eq!(tasks[2].delay, Duration::from_secs(120));

    // A fourth attempt is refused without touching the record.
    assert_eq!(
        h.dispatcher.process(id).await?,
        AttemptOutcome::Skipped { reason: SkipReason::NotEligible(DeliveryStatus::Failed) }
    );
    assert_eq!(h.record(id).await.attempts(), 3);
    assert_eq!(h.server.received_requests().await.map_or(0, |r| r.len()), 3);

    let stored = h.storage.subscription(sub.id).await.expect("subscription exists");
    assert_eq!(stored.failure_count, 3);

    let events = h.events.events.lock().await;
    assert!(matches!(
        events.as_slice(),
        [DeliveryEvent::Failed(_), DeliveryEvent::Failed(_), DeliveryEvent::Exhausted(e)]
            if e.attempts == 3 && e.response_status == Some(500)
    ));
    Ok(())
}

/// A client error is retried like a server error.
#[tokio::test]
async fn client_errors_are_retried() -> Result<()> {
    let h = Harness::new().await;
    h.respond_with(404).await;
    let sub = h.subscription(&["user.created"]).await;

    let id = h.dispatcher.enqueue(&sub, "user.created", json!({})).await?;
    let outcome = h.dispatcher.process(id).await?;

    assert!(matches!(outcome, AttemptOutcome::RetryScheduled { attempt: 1, .. }));
    assert_eq!(h.record(id).await.response_body(), Some("status 404"));
    Ok(())
}

/// A paused subscription skips the attempt and leaves the record alone.
#[tokio::test]
async fn paused_subscription_is_skipped_without_mutation() -> Result<()> {
    let h = Harness::new().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    let sub = h.subscription(&["user.created"]).await.with_status(SubscriptionStatus::Paused);
    h.storage.add_subscription(sub.clone()).await;

    let record = DeliveryRecord::new(sub.id, "user.created", json!({}), h.clock.now());
    let id = record.id();
    h.storage.add_delivery(record).await;

    let outcome = h.dispatcher.process(id).await?;
    assert_eq!(
        outcome,
        AttemptOutcome::Skipped {
            reason: SkipReason::SubscriptionInactive(SubscriptionStatus::Paused)
        }
    );

    let record = h.record(id).await;
    assert_eq!(record.status(), DeliveryStatus::Pending);
    assert_eq!(record.attempts(), 0);
    assert!(h.queue.enqueued().await.is_empty());
    Ok(())
}

/// A successful record is never sent twice.
#[tokio::test]
async fn successful_record_is_not_resent() -> Result<()> {
    let h = Harness::new().await;
    h.respond_with(200).await;
    let sub = h.subscription(&["user.created"]).await;

    let id = h.dispatcher.enqueue(&sub, "user.created", json!({})).await?;
    h.dispatcher.process(id).await?;

    let outcome = h.dispatcher.process(id).await?;
    assert_eq!(
        outcome,
        AttemptOutcome::Skipped { reason: SkipReason::NotEligible(DeliveryStatus::Successful) }
    );
    assert_eq!(h.server.received_requests().await.map_or(0, |r| r.len()), 1);
    Ok(())
}

/// A receiver slower than the subscription timeout records a failure
/// without a status code.
#[tokio::test]
async fn slow_receiver_records_timeout() -> Result<()> {
    let h = Harness::new().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&h.server)
        .await;

    let sub = h.subscription(&["user.created"]).await.with_timeout_seconds(1);
    h.storage.add_subscription(sub.clone()).await;

    let id = h.dispatcher.enqueue(&sub, "user.created", json!({})).await?;
    let outcome = h.dispatcher.process(id).await?;

    assert!(matches!(outcome, AttemptOutcome::RetryScheduled { attempt: 1, .. }));
    let record = h.record(id).await;
    assert_eq!(record.status(), DeliveryStatus::Failed);
    assert_eq!(record.response_code(), None);
    assert!(record.response_body().is_some_and(|body| body.contains("timeout")));
    Ok(())
}

/// Enqueue rejects event types the subscription does not list.
#[tokio::test]
async fn enqueue_rejects_unsubscribed_event() -> Result<()> {
    let h = Harness::new().await;
    let sub = h.subscription(&["user.created"]).await;

    let err = h.dispatcher.enqueue(&sub, "user.deleted", json!({})).await.unwrap_err();

    assert!(matches!(err, DeliveryError::NotSubscribed { ref event_type, .. } if event_type == "user.deleted"));
    assert!(h.storage.deliveries_for(sub.id).await.is_empty());
    Ok(())
}

/// Enqueue rejects disabled subscriptions.
#[tokio::test]
async fn enqueue_rejects_inactive_subscription() -> Result<()> {
    let h = Harness::new().await;
    let sub = h.subscription(&["user.created"]).await.with_status(SubscriptionStatus::Disabled);

    let err = h.dispatcher.enqueue(&sub, "user.created", json!({})).await.unwrap_err();

    assert!(matches!(
        err,
        DeliveryError::SubscriptionInactive { status: SubscriptionStatus::Disabled, .. }
    ));
    Ok(())
}

/// Broadcast fans out to active subscriptions listening for the event.
#[tokio::test]
async fn broadcast_targets_active_matching_subscriptions() -> Result<()> {
    let h = Harness::new().await;
    let first = h.subscription(&["order.paid"]).await;
    let second = h.subscription(&["order.paid", "order.refunded"]).await;
    let _other_event = h.subscription(&["order.refunded"]).await;
    let paused = h.subscription(&["order.paid"]).await.with_status(SubscriptionStatus::Paused);
    h.storage.add_subscription(paused.clone()).await;

    let ids = h.dispatcher.broadcast("order.paid", json!({"order": 42})).await?;

    assert_eq!(ids.len(), 2);
    assert_eq!(h.storage.deliveries_for(first.id).await.len(), 1);
    assert_eq!(h.storage.deliveries_for(second.id).await.len(), 1);
    assert!(h.storage.deliveries_for(paused.id).await.is_empty());
    assert_eq!(h.queue.len().await, 2);
    Ok(())
}

/// A storage failure before sending aborts the attempt and nothing is sent.
#[tokio::test]
async fn storage_failure_before_send_aborts_attempt() -> Result<()> {
    let h = Harness::new().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;
    let sub = h.subscription(&["user.created"]).await;

    let id = h.dispatcher.enqueue(&sub, "user.created", json!({})).await?;
    h.storage.inject_error(Operation::SaveDelivery, "connection reset").await;

    let err = h.dispatcher.process(id).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Storage { .. }));
    assert_eq!(h.record(id).await.status(), DeliveryStatus::Pending);
    Ok(())
}

/// A failed counter update does not fail the delivery.
#[tokio::test]
async fn counter_failure_is_not_fatal() -> Result<()> {
    let h = Harness::new().await;
    h.respond_with(200).await;
    let sub = h.subscription(&["user.created"]).await;

    let id = h.dispatcher.enqueue(&sub, "user.created", json!({})).await?;
    h.storage.inject_error(Operation::IncrementCounter, "deadlock").await;

    let outcome = h.dispatcher.process(id).await?;

    assert_eq!(outcome, AttemptOutcome::Delivered { status_code: 200 });
    assert_eq!(h.storage.subscription(sub.id).await.map(|s| s.success_count), Some(0));
    Ok(())
}

/// Processing an unknown ID reports it.
#[tokio::test]
async fn unknown_delivery_is_reported() -> Result<()> {
    let h = Harness::new().await;
    let missing = DeliveryId::new();

    let err = h.dispatcher.process(missing).await.unwrap_err();

    assert!(matches!(err, DeliveryError::DeliveryNotFound { delivery_id } if delivery_id == missing));
    Ok(())
}
