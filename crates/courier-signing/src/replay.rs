//! Timestamp freshness checks for signed callbacks.
//!
//! A captured `(payload, signature, timestamp)` triple stays valid forever
//! as far as the HMAC is concerned; the replay guard bounds how long it can
//! be reused. Tolerance is symmetric so timestamps from a receiver whose
//! clock runs ahead are rejected too.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default tolerance applied when none is configured.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Returns true iff `|now - timestamp| <= tolerance_seconds`.
///
/// `timestamp` is Unix seconds. The boundary is accepted.
pub fn is_fresh(timestamp: i64, tolerance_seconds: u64, now: DateTime<Utc>) -> bool {
    now.timestamp().abs_diff(timestamp) <= tolerance_seconds
}

/// Parses an `X-Webhook-Timestamp` header value.
pub fn parse_timestamp(header: &str) -> Option<i64> {
    header.trim().parse().ok()
}

/// Replay window with an injected tolerance.
#[derive(Debug, Clone, Copy)]
pub struct ReplayGuard {
    tolerance: Duration,
}

impl ReplayGuard {
    /// Creates a guard accepting timestamps within `tolerance` of now.
    pub fn new(tolerance: Duration) -> Self {
        Self { tolerance }
    }

    /// Configured tolerance.
    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// See [`is_fresh`].
    pub fn is_fresh(&self, timestamp: i64, now: DateTime<Utc>) -> bool {
        is_fresh(timestamp, self.tolerance.as_secs(), now)
    }

    /// Parses `header` and checks freshness. Unparsable headers are stale.
    pub fn is_fresh_header(&self, header: &str, now: DateTime<Utc>) -> bool {
        parse_timestamp(header).is_some_and(|timestamp| self.is_fresh(timestamp, now))
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}
