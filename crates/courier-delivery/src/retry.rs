//! Exponential backoff with a hard ceiling.
//!
//! `next_delay(attempt) = min(initial_delay * multiplier^(attempt - 1), max_delay)`
//! where `attempt` is the 1-based number of the attempt that just failed.
//! Every non-2xx status and every transport error is retried the same way;
//! a delivery is exhausted once `attempts >= max_retries`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(60);

/// Default backoff multiplier.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default ceiling for any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);

/// Backoff parameters shared by all subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Growth factor per failed attempt. Values below 1 are rejected by
    /// configuration validation.
    pub multiplier: f64,

    /// Upper bound for any computed delay.
    pub max_delay: Duration,

    /// Randomization (0.0 to 1.0) applied after capping. Zero keeps delays
    /// exact.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_factor: 0.0,
        }
    }
}

/// Outcome of a retry decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Enqueue another attempt after `delay`.
    Retry {
        /// Delay before the next attempt
        delay: Duration,
    },
    /// No attempts remain.
    Exhausted,
}

impl RetryPolicy {
    /// Creates a policy without jitter.
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self { initial_delay, multiplier, max_delay, jitter_factor: 0.0 }
    }

    /// Sets the jitter factor.
    #[must_use]
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Delay before retrying after the 1-based `attempt` failed.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = next_delay(attempt, self.initial_delay, self.multiplier, self.max_delay);
        let jittered = apply_jitter(delay, self.jitter_factor);
        std::cmp::min(jittered, self.max_delay)
    }

    /// Decides whether a delivery with `attempts` made may be retried.
    pub fn decide(&self, attempts: u32, max_retries: u32) -> RetryDecision {
        if is_exhausted(attempts, max_retries) {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry { delay: self.next_delay(attempts) }
        }
    }
}

/// `min(initial_delay * multiplier^(attempt - 1), max_delay)`.
///
/// Attempt 0 is treated like attempt 1. Overflowing or non-finite
/// intermediate values saturate to `max_delay`.
pub fn next_delay(
    attempt: u32,
    initial_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);

    if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
        return max_delay;
    }

    Duration::from_secs_f64(secs.max(0.0))
}

/// `attempts >= max_retries`.
pub fn is_exhausted(attempts: u32, max_retries: u32) -> bool {
    attempts >= max_retries
}

fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}
