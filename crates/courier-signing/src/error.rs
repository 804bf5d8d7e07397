//! Error types for signing and rotation.

use thiserror::Error;

/// Errors produced while computing a signature.
///
/// Verification never returns these: malformed input simply fails to
/// verify.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The subscription has no key material to sign with.
    #[error("signing secret is empty")]
    EmptySecret,

    /// The payload could not be written in canonical form.
    #[error("failed to encode canonical payload: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The HMAC implementation rejected the key.
    #[error("invalid signing key")]
    InvalidKey,
}

/// Misuse of the rotation state machine.
///
/// These indicate corrupted subscription state rather than a bad request,
/// so callers should fail fast instead of treating them as "not verified".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RotationError {
    /// Rotation requested for a subscription without a current secret.
    #[error("subscription has no current secret to rotate")]
    MissingCurrentSecret,

    /// Previous secret and its rotation timestamps disagree.
    #[error("malformed rotation state: {reason}")]
    MalformedState {
        /// Which part of the state is inconsistent
        reason: String,
    },
}

impl RotationError {
    /// Creates a malformed state error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedState { reason: reason.into() }
    }
}
