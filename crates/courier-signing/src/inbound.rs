//! Verification of signed callbacks received by Courier.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, Subscription};
use serde_json::Value;
use tracing::debug;

use crate::{canonical, codec, error::RotationError, replay::ReplayGuard, SecretRotationManager};

/// Validates inbound callbacks against a subscription's active secrets.
///
/// The timestamp is checked before any HMAC is computed, so stale requests
/// are rejected without touching key material.
#[derive(Debug, Clone)]
pub struct InboundVerifier {
    replay: ReplayGuard,
    rotation: SecretRotationManager,
    clock: Arc<dyn Clock>,
}

impl InboundVerifier {
    /// Creates a verifier with the given replay tolerance.
    pub fn new(tolerance: Duration, rotation: SecretRotationManager, clock: Arc<dyn Clock>) -> Self {
        Self { replay: ReplayGuard::new(tolerance), rotation, clock }
    }

    /// Whether a timestamp header is present and inside the replay window.
    ///
    /// Needs no subscription, so callers can reject stale requests before
    /// loading anything.
    pub fn is_fresh(&self, timestamp_header: Option<&str>) -> bool {
        let now = self.clock.now();
        timestamp_header.is_some_and(|timestamp| self.replay.is_fresh_header(timestamp, now))
    }

    /// Returns true iff the timestamp is fresh and the signature matches any
    /// active secret of `subscription`.
    ///
    /// Missing headers, unparsable timestamps, and malformed signatures all
    /// yield `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns `RotationError` only when the subscription's secret state is
    /// corrupt.
    pub fn validate_inbound(
        &self,
        payload: &Value,
        signature_header: Option<&str>,
        timestamp_header: Option<&str>,
        subscription: &Subscription,
    ) -> Result<bool, RotationError> {
        let now = self.clock.now();

        let Some(timestamp) = timestamp_header else {
            debug!(subscription_id = %subscription.id, "callback missing timestamp");
            return Ok(false);
        };
        if !self.replay.is_fresh_header(timestamp, now) {
            debug!(subscription_id = %subscription.id, timestamp, "callback timestamp outside tolerance");
            return Ok(false);
        }

        let Some(signature) = signature_header else {
            debug!(subscription_id = %subscription.id, "callback missing signature");
            return Ok(false);
        };

        let Ok(bytes) = canonical::to_vec(payload) else {
            return Ok(false);
        };

        let secrets = self.rotation.active_secrets(subscription, now)?;
        let matched = secrets.iter().any(|secret| codec::verify_bytes(&bytes, signature, secret));

        if !matched {
            debug!(
                subscription_id = %subscription.id,
                secrets_checked = secrets.len(),
                "callback signature mismatch"
            );
        }

        Ok(matched)
    }
}
