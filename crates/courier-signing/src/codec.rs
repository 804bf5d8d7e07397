//! HMAC-SHA256 signatures over canonical payloads.
//!
//! Signatures are lowercase hex. Verification accepts the bare hex form
//! sent in `X-Webhook-Signature` and the GitHub-style `sha256=<hex>` form.

use courier_core::SigningSecret;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::{canonical, error::SignatureError};

type HmacSha256 = Hmac<Sha256>;

/// Hex length of an HMAC-SHA256 signature.
pub const SIGNATURE_HEX_LEN: usize = 64;

/// Signs the canonical encoding of `payload`.
///
/// Deterministic for identical `(payload, secret)`.
///
/// # Errors
///
/// Returns `SignatureError::EmptySecret` for a secret without key material.
pub fn sign(payload: &Value, secret: &SigningSecret) -> Result<String, SignatureError> {
    let bytes = canonical::to_vec(payload)?;
    sign_bytes(&bytes, secret)
}

/// Signs bytes that are already in canonical form.
///
/// The dispatcher uses this so the exact bytes it signs are the bytes it
/// sends.
///
/// # Errors
///
/// Returns `SignatureError::EmptySecret` for a secret without key material.
pub fn sign_bytes(bytes: &[u8], secret: &SigningSecret) -> Result<String, SignatureError> {
    let mac = keyed_mac(secret, bytes)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies `signature` against the canonical encoding of `payload`.
///
/// Never errors: a malformed signature, an empty secret, or a payload that
/// cannot be encoded all return `false`. The final comparison is constant
/// time.
pub fn verify(payload: &Value, signature: &str, secret: &SigningSecret) -> bool {
    match canonical::to_vec(payload) {
        Ok(bytes) => verify_bytes(&bytes, signature, secret),
        Err(_) => false,
    }
}

/// Verifies `signature` against bytes already in canonical form.
pub fn verify_bytes(bytes: &[u8], signature: &str, secret: &SigningSecret) -> bool {
    let Some(expected) = decode_signature(signature) else {
        return false;
    };

    match keyed_mac(secret, bytes) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

fn keyed_mac(secret: &SigningSecret, bytes: &[u8]) -> Result<HmacSha256, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.expose()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(bytes);
    Ok(mac)
}

fn decode_signature(signature: &str) -> Option<Vec<u8>> {
    let hex_signature = signature.trim();
    let hex_signature = hex_signature.strip_prefix("sha256=").unwrap_or(hex_signature);

    if hex_signature.len() != SIGNATURE_HEX_LEN {
        return None;
    }

    hex::decode(hex_signature).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload() -> Value {
        json!({"event": "user.created", "data": {"id": "u1"}})
    }

    #[test]
    fn sign_is_lowercase_hex_of_expected_length() {
        let signature = sign(&payload(), &SigningSecret::from("s3cr3t")).unwrap();

        assert_eq!(signature.len(), SIGNATURE_HEX_LEN);
        assert!(signature.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn sign_matches_hmac_of_canonical_bytes() {
        let secret = SigningSecret::from("s3cr3t");
        let canonical = br#"{"data":{"id":"u1"},"event":"user.created"}"#;

        assert_eq!(sign(&payload(), &secret).unwrap(), sign_bytes(canonical, &secret).unwrap());
    }

    #[test]
    fn empty_secret_cannot_sign() {
        let err = sign(&payload(), &SigningSecret::new(Vec::new())).unwrap_err();
        assert!(matches!(err, SignatureError::EmptySecret));
    }

    #[test]
    fn prefixed_signature_verifies() {
        let secret = SigningSecret::from("s3cr3t");
        let signature = sign(&payload(), &secret).unwrap();

        assert!(verify(&payload(), &format!("sha256={signature}"), &secret));
    }

    #[test]
    fn malformed_signatures_fail_without_panicking() {
        let secret = SigningSecret::from("s3cr3t");
        let non_hex = "g".repeat(64);
        let too_long = "a".repeat(65);
        let candidates: [&str; 6] = ["", "not-hex", "zz", "abc123", &non_hex, &too_long];

        for candidate in candidates {
            assert!(!verify(&payload(), candidate, &secret), "accepted {candidate:?}");
        }
    }

    #[test]
    fn uppercase_hex_is_accepted() {
        let secret = SigningSecret::from("s3cr3t");
        let signature = sign(&payload(), &secret).unwrap().to_uppercase();

        assert!(verify(&payload(), &signature, &secret));
    }

    #[test]
    fn empty_secret_never_verifies() {
        let signature = sign(&payload(), &SigningSecret::from("s3cr3t")).unwrap();
        assert!(!verify(&payload(), &signature, &SigningSecret::new(Vec::new())));
    }
}
