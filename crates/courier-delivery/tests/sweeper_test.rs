//! Rotation sweeper against in-memory storage.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use courier_core::{
    error::Result as CoreResult, Clock, CounterField, DeliveryId, DeliveryRecord, SigningSecret,
    Subscription, SubscriptionId, SubscriptionStatus, TestClock,
};
use courier_delivery::{storage::mock::MockDeliveryStorage, DeliveryStorage, RotationSweeper};
use courier_signing::{OsSecretGenerator, SecretRotationManager};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

struct Setup {
    clock: TestClock,
    storage: MockDeliveryStorage,
    rotation: SecretRotationManager,
    sweeper: RotationSweeper,
}

fn setup() -> Setup {
    let clock = TestClock::with_start_time(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    let storage = MockDeliveryStorage::new();
    let rotation =
        SecretRotationManager::new(Arc::new(clock.clone()), Arc::new(OsSecretGenerator));
    let sweeper = RotationSweeper::new(
        Arc::new(storage.clone()),
        rotation.clone(),
        Arc::new(clock.clone()),
        Duration::from_secs(3600),
        CancellationToken::new(),
    );
    Setup { clock, storage, rotation, sweeper }
}

fn subscription(clock: &TestClock) -> Subscription {
    Subscription::new(
        "crm",
        "https://example.com/hook",
        SigningSecret::from("s3cr3t"),
        vec!["user.created".to_string()],
        clock.now(),
    )
}

#[tokio::test]
async fn previous_secret_is_kept_during_grace_period() -> Result<()> {
    let s = setup();
    let mut sub = subscription(&s.clock);
    s.rotation.rotate(&mut sub, 7)?;
    s.storage.add_subscription(sub.clone()).await;

    s.clock.advance(6 * DAY);
    assert_eq!(s.sweeper.sweep_once().await?, 0);

    let stored = s.storage.subscription(sub.id).await.expect("subscription exists");
    assert_eq!(stored.previous_secret, Some(SigningSecret::from("s3cr3t")));
    Ok(())
}

#[tokio::test]
async fn expired_previous_secret_is_cleared() -> Result<()> {
    let s = setup();
    let mut sub = subscription(&s.clock);
    let rotated_at = s.clock.now();
    s.rotation.rotate(&mut sub, 7)?;
    s.storage.add_subscription(sub.clone()).await;

    s.clock.advance(8 * DAY);
    assert_eq!(s.sweeper.sweep_once().await?, 1);

    let stored = s.storage.subscription(sub.id).await.expect("subscription exists");
    assert!(stored.previous_secret.is_none());
    assert!(stored.previous_secret_expires_at.is_none());
    assert_eq!(stored.secret_rotated_at, Some(rotated_at));
    assert_eq!(stored.secret, sub.secret);

    // Nothing left to clear.
    assert_eq!(s.sweeper.sweep_once().await?, 0);
    Ok(())
}

#[tokio::test]
async fn malformed_rotation_state_is_skipped() -> Result<()> {
    let s = setup();

    let mut broken = subscription(&s.clock);
    broken.previous_secret = Some(SigningSecret::from("old"));
    s.storage.add_subscription(broken.clone()).await;

    let mut expired = subscription(&s.clock);
    s.rotation.rotate(&mut expired, 1)?;
    s.storage.add_subscription(expired.clone()).await;

    s.clock.advance(2 * DAY);
    assert_eq!(s.sweeper.sweep_once().await?, 1);

    let stored = s.storage.subscription(broken.id).await.expect("subscription exists");
    assert_eq!(stored.previous_secret, Some(SigningSecret::from("old")));
    Ok(())
}

#[tokio::test]
async fn run_stops_when_cancelled() -> Result<()> {
    let s = setup();
    let token = CancellationToken::new();
    let sweeper = RotationSweeper::new(
        Arc::new(s.storage.clone()),
        s.rotation.clone(),
        Arc::new(s.clock.clone()),
        Duration::from_secs(3600),
        token.clone(),
    );

    let handle = tokio::spawn(sweeper.run());
    token.cancel();

    tokio::time::timeout(Duration::from_secs(2), handle).await??;
    Ok(())
}

/// Storage that writes `edit` right after the sweeper has loaded its
/// candidates, as an owner updating the subscription mid-sweep would.
struct EditDuringSweep {
    inner: MockDeliveryStorage,
    edit: Mutex<Option<Subscription>>,
}

impl DeliveryStorage for EditDuringSweep {
    fn find_subscription(
        &self,
        id: SubscriptionId,
    ) -> Pin<Box<dyn Future<Output = CoreResult<Option<Subscription>>> + Send + '_>> {
        self.inner.find_subscription(id)
    }

    fn save_subscription(
        &self,
        subscription: Subscription,
    ) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>> {
        self.inner.save_subscription(subscription)
    }

    fn find_subscriptions_for_event(
        &self,
        event_type: String,
    ) -> Pin<Box<dyn Future<Output = CoreResult<Vec<Subscription>>> + Send + '_>> {
        self.inner.find_subscriptions_for_event(event_type)
    }

    fn find_subscriptions_with_previous_secret(
        &self,
    ) -> Pin<Box<dyn Future<Output = CoreResult<Vec<Subscription>>> + Send + '_>> {
        Box::pin(async move {
            let candidates = self.inner.find_subscriptions_with_previous_secret().await?;
            if let Some(edit) = self.edit.lock().await.take() {
                self.inner.add_subscription(edit).await;
            }
            Ok(candidates)
        })
    }

    fn clear_expired_previous_secret(
        &self,
        id: SubscriptionId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = CoreResult<bool>> + Send + '_>> {
        self.inner.clear_expired_previous_secret(id, now)
    }

    fn find_delivery(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = CoreResult<Option<DeliveryRecord>>> + Send + '_>> {
        self.inner.find_delivery(id)
    }

    fn create_delivery(
        &self,
        record: DeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>> {
        self.inner.create_delivery(record)
    }

    fn save_delivery(
        &self,
        record: DeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>> {
        self.inner.save_delivery(record)
    }

    fn increment_counter(
        &self,
        id: SubscriptionId,
        field: CounterField,
        triggered_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + '_>> {
        self.inner.increment_counter(id, field, triggered_at)
    }
}

fn sweeper_over(s: &Setup, edit: Subscription) -> RotationSweeper {
    let storage = EditDuringSweep { inner: s.storage.clone(), edit: Mutex::new(Some(edit)) };
    RotationSweeper::new(
        Arc::new(storage),
        s.rotation.clone(),
        Arc::new(s.clock.clone()),
        Duration::from_secs(3600),
        CancellationToken::new(),
    )
}

/// Pausing a subscription while the sweep runs survives the sweep.
#[tokio::test]
async fn pause_during_sweep_is_kept() -> Result<()> {
    let s = setup();
    let mut sub = subscription(&s.clock);
    s.rotation.rotate(&mut sub, 7)?;
    s.storage.add_subscription(sub.clone()).await;
    s.clock.advance(8 * DAY);

    let paused = sub.clone().with_status(SubscriptionStatus::Paused);
    assert_eq!(sweeper_over(&s, paused).sweep_once().await?, 1);

    let stored = s.storage.subscription(sub.id).await.expect("subscription exists");
    assert_eq!(stored.status, SubscriptionStatus::Paused);
    assert!(stored.previous_secret.is_none());
    assert_eq!(stored.secret, sub.secret);
    Ok(())
}

/// A rotation that lands while the sweep runs keeps its new secret and its
/// fresh grace period.
#[tokio::test]
async fn rotation_during_sweep_is_kept() -> Result<()> {
    let s = setup();
    let mut sub = subscription(&s.clock);
    s.rotation.rotate(&mut sub, 7)?;
    s.storage.add_subscription(sub.clone()).await;
    s.clock.advance(8 * DAY);

    let mut rotated = sub.clone();
    s.rotation.rotate(&mut rotated, 7)?;
    assert_eq!(sweeper_over(&s, rotated.clone()).sweep_once().await?, 0);

    let stored = s.storage.subscription(sub.id).await.expect("subscription exists");
    assert_eq!(stored.secret, rotated.secret);
    assert_eq!(stored.previous_secret, Some(sub.secret.clone()));
    assert_eq!(stored.previous_secret_expires_at, rotated.previous_secret_expires_at);
    Ok(())
}
