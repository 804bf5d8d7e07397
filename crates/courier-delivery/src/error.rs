//! Error types for webhook delivery operations.
//!
//! Attempt-level failures (`Network`, `Timeout`, `ReceiverError`,
//! `Interrupted`) never leave the dispatcher: they are converted into
//! delivery record state and a retry decision. The remaining variants
//! describe why an enqueue or an attempt could not run at all.

use std::fmt;

use courier_core::{CoreError, DeliveryId, SubscriptionId, SubscriptionStatus};
use courier_signing::SignatureError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions of the delivery engine.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection-level failure (DNS, refused, reset).
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request exceeded the subscription timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Timeout that elapsed
        timeout_seconds: u64,
    },

    /// Receiver answered with a non-2xx status. 4xx and 5xx are not
    /// distinguished.
    #[error("receiver responded with HTTP {status_code}")]
    ReceiverError {
        /// HTTP status code
        status_code: u16,
        /// Captured response body
        body: String,
    },

    /// A worker lost its lease while the attempt was in flight, so its
    /// outcome was never recorded.
    #[error("attempt {attempt} was interrupted before its outcome was recorded")]
    Interrupted {
        /// Attempt number left in `processing`
        attempt: u32,
    },

    /// No subscription with this ID exists.
    #[error("subscription {subscription_id} not found")]
    SubscriptionNotFound {
        /// Requested subscription
        subscription_id: SubscriptionId,
    },

    /// No delivery record with this ID exists.
    #[error("delivery {delivery_id} not found")]
    DeliveryNotFound {
        /// Requested delivery
        delivery_id: DeliveryId,
    },

    /// Subscription does not list the event type.
    #[error("subscription {subscription_id} is not subscribed to {event_type}")]
    NotSubscribed {
        /// Target subscription
        subscription_id: SubscriptionId,
        /// Event type that was rejected
        event_type: String,
    },

    /// Subscription is paused or disabled.
    #[error("subscription {subscription_id} is {status}")]
    SubscriptionInactive {
        /// Target subscription
        subscription_id: SubscriptionId,
        /// Its current status
        status: SubscriptionStatus,
    },

    /// Persistence failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Task queue failed.
    #[error("task queue error: {message}")]
    Queue {
        /// Queue error message
        message: String,
    },

    /// Invalid engine configuration.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// The outbound payload could not be signed.
    #[error("signing failed: {message}")]
    Signing {
        /// Signing error message
        message: String,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker index
        worker_id: usize,
        /// Join error text
        error: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("graceful shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: std::time::Duration,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a receiver error from an HTTP response.
    pub fn receiver_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ReceiverError { status_code, body: body.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a task queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this error is an attempt failure that the retry policy
    /// handles, as opposed to a reason the attempt could not run.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ReceiverError { .. }
            | Self::Interrupted { .. } => true,

            Self::SubscriptionNotFound { .. }
            | Self::DeliveryNotFound { .. }
            | Self::NotSubscribed { .. }
            | Self::SubscriptionInactive { .. }
            | Self::Storage { .. }
            | Self::Queue { .. }
            | Self::Configuration { .. }
            | Self::Signing { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// HTTP status attached to the error, if the receiver answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ReceiverError { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<SignatureError> for DeliveryError {
    fn from(err: SignatureError) -> Self {
        Self::Signing { message: err.to_string() }
    }
}

/// Category of delivery error for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    /// Non-2xx responses.
    Receiver,
    /// Unknown, unsubscribed or inactive subscriptions and records.
    Subscription,
    /// Persistence and queue failures.
    Storage,
    /// Configuration problems.
    Configuration,
    /// Interrupted attempts, signing, worker and internal errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ReceiverError { .. } => Self::Receiver,
            DeliveryError::SubscriptionNotFound { .. }
            | DeliveryError::DeliveryNotFound { .. }
            | DeliveryError::NotSubscribed { .. }
            | DeliveryError::SubscriptionInactive { .. } => Self::Subscription,
            DeliveryError::Storage { .. } | DeliveryError::Queue { .. } => Self::Storage,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::Interrupted { .. }
            | DeliveryError::Signing { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Receiver => write!(f, "receiver"),
            Self::Subscription => write!(f, "subscription"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
