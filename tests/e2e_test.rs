//! End-to-end flows across delivery, secret rotation and inbound
//! verification.
//!
//! Wires the same components the binary does, with in-memory storage and
//! queue, a wiremock receiver, and one test clock shared by everything.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use courier_api::{create_router, AppState, ReadinessCheck};
use courier_core::{Clock, DeliveryStatus, SigningSecret, Subscription, TestClock};
use courier_delivery::{
    client::{SIGNATURE_HEADER, TIMESTAMP_HEADER},
    storage::mock::MockDeliveryStorage,
    DeliveryClient, DeliveryStorage, DeliveryWorker, EngineStats, InMemoryTaskQueue, RetryPolicy,
    RotationSweeper, WebhookDispatcher, WorkerConfig,
};
use courier_signing::{
    codec, rotation::DEFAULT_GRACE_PERIOD_DAYS, InboundVerifier, OsSecretGenerator,
    SecretRotationManager,
};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct AlwaysReady;

#[async_trait]
impl ReadinessCheck for AlwaysReady {
    async fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

struct Courier {
    clock: TestClock,
    storage: MockDeliveryStorage,
    dispatcher: WebhookDispatcher,
    worker: DeliveryWorker,
    rotation: SecretRotationManager,
    sweeper: RotationSweeper,
    router: Router,
    receiver: MockServer,
}

impl Courier {
    async fn start() -> Self {
        let clock = TestClock::with_start_time(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let storage = MockDeliveryStorage::new();
        let queue = Arc::new(InMemoryTaskQueue::new(shared_clock.clone()));

        let dispatcher = WebhookDispatcher::new(
            Arc::new(storage.clone()),
            queue.clone(),
            DeliveryClient::with_defaults().expect("client builds"),
            RetryPolicy::new(Duration::from_secs(60), 2.0, Duration::from_secs(3600)),
            shared_clock.clone(),
        );

        let worker = DeliveryWorker::new(
            0,
            dispatcher.clone(),
            queue,
            WorkerConfig::default(),
            Arc::new(RwLock::new(EngineStats::default())),
            CancellationToken::new(),
            shared_clock.clone(),
        );

        let rotation = SecretRotationManager::new(shared_clock.clone(), Arc::new(OsSecretGenerator));
        let sweeper = RotationSweeper::new(
            Arc::new(storage.clone()),
            rotation.clone(),
            shared_clock.clone(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );

        let verifier =
            InboundVerifier::new(Duration::from_secs(300), rotation.clone(), shared_clock.clone());
        let state =
            AppState::new(Arc::new(storage.clone()), verifier, Arc::new(AlwaysReady), shared_clock);
        let router = create_router(state, Duration::from_secs(30));

        let receiver = MockServer::start().await;

        Self { clock, storage, dispatcher, worker, rotation, sweeper, router, receiver }
    }

    async fn subscription(&self) -> Subscription {
        let sub = Subscription::new(
            "orders",
            format!("{}/hooks/orders", self.receiver.uri()),
            SigningSecret::from("whsec_initial"),
            vec!["order.shipped".to_string()],
            self.clock.now(),
        );
        self.storage.add_subscription(sub.clone()).await;
        sub
    }

    async fn callback(&self, sub: &Subscription, body: Vec<u8>, signature: &str) -> StatusCode {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/callbacks/{}", sub.id))
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, self.clock.now().timestamp().to_string())
            .body(Body::from(body))
            .unwrap();
        self.router.clone().oneshot(request).await.expect("router is infallible").status()
    }
}

/// A delivered webhook verifies at the receiver, and the receiver can sign a
/// callback with the same secret that Courier then accepts.
#[tokio::test]
async fn delivered_webhook_verifies_and_callback_is_accepted() -> Result<()> {
    let courier = Courier::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hooks/orders"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&courier.receiver)
        .await;

    let sub = courier.subscription().await;
    let id = courier
        .dispatcher
        .enqueue(&sub, "order.shipped", json!({"order": "ord_1", "carrier": "dhl"}))
        .await?;

    assert_eq!(courier.worker.process_batch().await?, 1);

    let requests = courier.receiver.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let signature = request.headers.get(SIGNATURE_HEADER).expect("signature header").to_str()?;
    let body: Value = serde_json::from_slice(&request.body)?;
    assert!(codec::verify(&body, signature, &sub.secret));
    assert_eq!(body["order"], "ord_1");
    assert_eq!(body["event"], "order.shipped");
    assert_eq!(body["delivery_id"], id.to_string());

    let record = courier.storage.delivery(id).await.expect("delivery exists");
    assert_eq!(record.status(), DeliveryStatus::Successful);

    let ack = json!({"acknowledged": id.to_string()});
    let ack_signature = codec::sign(&ack, &sub.secret)?;
    let status = courier.callback(&sub, serde_json::to_vec(&ack)?, &ack_signature).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    Ok(())
}

/// A 5xx is retried after the backoff delay and the second attempt lands.
#[tokio::test]
async fn failed_delivery_is_retried_after_backoff() -> Result<()> {
    let courier = Courier::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&courier.receiver)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&courier.receiver)
        .await;

    let sub = courier.subscription().await;
    let id = courier.dispatcher.enqueue(&sub, "order.shipped", json!({"order": "ord_2"})).await?;

    assert_eq!(courier.worker.process_batch().await?, 1);
    let record = courier.storage.delivery(id).await.expect("delivery exists");
    assert_eq!(record.status(), DeliveryStatus::Failed);
    assert_eq!(record.response_code(), Some(503));

    // Retry is not due before the first backoff step.
    courier.clock.advance(Duration::from_secs(59));
    assert_eq!(courier.worker.process_batch().await?, 0);

    courier.clock.advance(Duration::from_secs(1));
    assert_eq!(courier.worker.process_batch().await?, 1);

    let record = courier.storage.delivery(id).await.expect("delivery exists");
    assert_eq!(record.status(), DeliveryStatus::Successful);
    assert_eq!(record.attempts(), 2);

    let stored = courier.storage.subscription(sub.id).await.expect("subscription exists");
    assert_eq!(stored.success_count, 1);
    assert_eq!(stored.failure_count, 1);
    Ok(())
}

/// After a rotation outbound deliveries use the new secret, callbacks signed
/// with the old secret work until the grace period ends, and the sweeper
/// then drops the old secret.
#[tokio::test]
async fn rotation_keeps_old_secret_for_callbacks_until_swept() -> Result<()> {
    let courier = Courier::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&courier.receiver)
        .await;

    let mut sub = courier.subscription().await;
    let old_secret = sub.secret.clone();
    let new_secret_text = courier.rotation.rotate(&mut sub, DEFAULT_GRACE_PERIOD_DAYS)?;
    courier.storage.save_subscription(sub.clone()).await?;
    let new_secret = SigningSecret::from(new_secret_text.as_str());

    courier.dispatcher.enqueue(&sub, "order.shipped", json!({"order": "ord_3"})).await?;
    assert_eq!(courier.worker.process_batch().await?, 1);

    let requests = courier.receiver.received_requests().await.expect("recording enabled");
    let signature = requests[0].headers.get(SIGNATURE_HEADER).expect("signature header").to_str()?;
    let body: Value = serde_json::from_slice(&requests[0].body)?;
    assert!(codec::verify(&body, signature, &new_secret));
    assert!(!codec::verify(&body, signature, &old_secret));

    let callback = json!({"status": "received"});
    let old_signature = codec::sign(&callback, &old_secret)?;
    let new_signature = codec::sign(&callback, &new_secret)?;

    courier.clock.advance(DAY);
    assert_eq!(courier.sweeper.sweep_once().await?, 0);
    let status = courier.callback(&sub, serde_json::to_vec(&callback)?, &old_signature).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    courier.clock.advance(7 * DAY);
    assert_eq!(courier.sweeper.sweep_once().await?, 1);

    let stored = courier.storage.subscription(sub.id).await.expect("subscription exists");
    assert!(stored.previous_secret.is_none());

    let status = courier.callback(&sub, serde_json::to_vec(&callback)?, &old_signature).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let status = courier.callback(&sub, serde_json::to_vec(&callback)?, &new_signature).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    Ok(())
}
