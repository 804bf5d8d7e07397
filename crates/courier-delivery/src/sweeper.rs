//! Periodic removal of expired previous secrets.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use courier_signing::SecretRotationManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{error::Result, storage::DeliveryStorage};

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Clears previous secrets whose grace period has ended.
///
/// Verification already ignores an expired previous secret, so the sweep
/// only keeps stored state tidy.
pub struct RotationSweeper {
    storage: Arc<dyn DeliveryStorage>,
    rotation: SecretRotationManager,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl RotationSweeper {
    /// Creates a sweeper that runs every `interval` until `cancellation_token`
    /// is cancelled.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        rotation: SecretRotationManager,
        clock: Arc<dyn Clock>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { storage, rotation, clock, interval, cancellation_token }
    }

    /// Sweeps immediately, then every interval, until cancelled.
    pub async fn run(self) {
        info!(interval_seconds = self.interval.as_secs(), "rotation sweeper starting");

        loop {
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "rotation sweep failed");
            }

            tokio::select! {
                () = self.clock.sleep(self.interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!("rotation sweeper stopped");
    }

    /// Runs one sweep and returns the number of subscriptions cleared.
    ///
    /// Candidates are checked in memory, then cleared through a conditional
    /// update that touches only the previous-secret fields. A subscription
    /// rotated or edited since it was loaded is left as it is now stored.
    /// Malformed rotation state and failed updates are logged per
    /// subscription and do not stop the sweep.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the candidate subscriptions cannot be loaded.
    pub async fn sweep_once(&self) -> Result<usize> {
        let candidates = self.storage.find_subscriptions_with_previous_secret().await?;
        let now = self.clock.now();
        let mut cleared = 0;

        for mut subscription in candidates {
            match self.rotation.clear_expired_previous(&mut subscription, now) {
                Ok(true) => {},
                Ok(false) => continue,
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "skipping subscription with malformed rotation state"
                    );
                    continue;
                },
            }

            match self.storage.clear_expired_previous_secret(subscription.id, now).await {
                Ok(true) => cleared += 1,
                Ok(false) => {
                    debug!(
                        subscription_id = %subscription.id,
                        "previous secret changed since the sweep loaded it, left untouched"
                    );
                },
                Err(e) => {
                    error!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "failed to clear expired previous secret"
                    );
                },
            }
        }

        debug!(cleared, "rotation sweep completed");
        Ok(cleared)
    }
}
