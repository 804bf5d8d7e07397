//! Secret rotation with a grace period.
//!
//! A subscription is either in single-secret state or in dual-secret state
//! while the secret replaced by the last rotation is still accepted for
//! inbound verification. Outbound deliveries are always signed with the
//! current secret only.
//!
//! Each rotation records its own expiry in `previous_secret_expires_at`, so
//! changing the configured grace period does not retroactively shorten or
//! extend rotations that already happened.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use courier_core::{Clock, SigningSecret, Subscription};
use tracing::info;

use crate::{error::RotationError, secret::SecretGenerator};

/// Default grace period for a rotated-out secret.
pub const DEFAULT_GRACE_PERIOD_DAYS: u32 = 7;

/// Issues new secrets and decides which secrets are currently acceptable.
#[derive(Debug, Clone)]
pub struct SecretRotationManager {
    clock: Arc<dyn Clock>,
    generator: Arc<dyn SecretGenerator>,
}

impl SecretRotationManager {
    /// Creates a manager with injected time and randomness.
    pub fn new(clock: Arc<dyn Clock>, generator: Arc<dyn SecretGenerator>) -> Self {
        Self { clock, generator }
    }

    /// Replaces the current secret and moves it into the previous slot.
    ///
    /// Returns the new secret in textual form. This is the only time it is
    /// exposed; afterwards it lives in the subscription as opaque bytes.
    /// Rotating again during a grace period discards the older previous
    /// secret.
    ///
    /// # Errors
    ///
    /// Returns `RotationError::MissingCurrentSecret` if the subscription has
    /// no secret to rotate away from.
    pub fn rotate(
        &self,
        subscription: &mut Subscription,
        grace_period_days: u32,
    ) -> Result<String, RotationError> {
        if subscription.secret.is_empty() {
            return Err(RotationError::MissingCurrentSecret);
        }

        let now = self.clock.now();
        let new_secret = self.generator.generate();
        let expires_at = now + Duration::days(i64::from(grace_period_days));

        let old = std::mem::replace(
            &mut subscription.secret,
            SigningSecret::from(new_secret.as_str()),
        );
        subscription.previous_secret = Some(old);
        subscription.secret_rotated_at = Some(now);
        subscription.previous_secret_expires_at = Some(expires_at);
        subscription.updated_at = now;

        info!(
            subscription_id = %subscription.id,
            grace_period_days,
            previous_secret_expires_at = %expires_at,
            "signing secret rotated"
        );

        Ok(new_secret)
    }

    /// Whether the previous secret is still inside its grace period.
    ///
    /// # Errors
    ///
    /// Returns `RotationError::MalformedState` if a previous secret exists
    /// without consistent rotation timestamps.
    pub fn is_previous_secret_valid(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<bool, RotationError> {
        match grace_window(subscription)? {
            Some((_, expires_at)) => Ok(now <= expires_at),
            None => Ok(false),
        }
    }

    /// Secrets acceptable for verification at `now`, current first.
    ///
    /// # Errors
    ///
    /// Returns `RotationError::MissingCurrentSecret` for a subscription
    /// without a secret and `RotationError::MalformedState` for
    /// inconsistent rotation timestamps.
    pub fn active_secrets<'a>(
        &self,
        subscription: &'a Subscription,
        now: DateTime<Utc>,
    ) -> Result<Vec<&'a SigningSecret>, RotationError> {
        if subscription.secret.is_empty() {
            return Err(RotationError::MissingCurrentSecret);
        }

        let mut secrets = vec![&subscription.secret];
        if self.is_previous_secret_valid(subscription, now)? {
            secrets.extend(subscription.previous_secret.as_ref());
        }

        Ok(secrets)
    }

    /// Drops an expired previous secret. Returns true if the subscription
    /// changed and needs to be saved.
    ///
    /// # Errors
    ///
    /// Returns `RotationError::MalformedState` for inconsistent rotation
    /// timestamps.
    pub fn clear_expired_previous(
        &self,
        subscription: &mut Subscription,
        now: DateTime<Utc>,
    ) -> Result<bool, RotationError> {
        if subscription.previous_secret.is_none() {
            return Ok(false);
        }

        if self.is_previous_secret_valid(subscription, now)? {
            return Ok(false);
        }

        subscription.previous_secret = None;
        subscription.previous_secret_expires_at = None;
        subscription.updated_at = now;

        info!(subscription_id = %subscription.id, "expired previous secret cleared");

        Ok(true)
    }
}

fn grace_window(
    subscription: &Subscription,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, RotationError> {
    if subscription.previous_secret.is_none() {
        return Ok(None);
    }

    let rotated_at = subscription
        .secret_rotated_at
        .ok_or_else(|| RotationError::malformed("previous secret without rotation timestamp"))?;
    let expires_at = subscription
        .previous_secret_expires_at
        .ok_or_else(|| RotationError::malformed("previous secret without expiry"))?;

    if expires_at < rotated_at {
        return Err(RotationError::malformed("previous secret expires before rotation"));
    }

    Ok(Some((rotated_at, expires_at)))
}
