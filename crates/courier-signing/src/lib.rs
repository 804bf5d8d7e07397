//! Webhook authenticity primitives.
//!
//! Signs outbound payloads with HMAC-SHA256 over a canonical JSON encoding,
//! rejects replayed callbacks outside a timestamp tolerance, and rotates
//! subscription secrets with a grace period during which both the old and
//! the new secret verify.
//!
//! # Example
//!
//! ```
//! use courier_core::SigningSecret;
//! use courier_signing::codec;
//! use serde_json::json;
//!
//! let payload = json!({"event": "user.created", "data": {"id": "u1"}});
//! let secret = SigningSecret::from("s3cr3t");
//!
//! let signature = codec::sign(&payload, &secret).unwrap();
//! assert!(codec::verify(&payload, &signature, &secret));
//! assert!(!codec::verify(&payload, &signature, &SigningSecret::from("s3cr3t2")));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod codec;
pub mod error;
pub mod inbound;
pub mod replay;
pub mod rotation;
pub mod secret;

pub use error::{RotationError, SignatureError};
pub use inbound::InboundVerifier;
pub use replay::ReplayGuard;
pub use rotation::SecretRotationManager;
pub use secret::{OsSecretGenerator, SecretGenerator};
