//! Signing secret generation.

use rand::RngCore;

/// Prefix marking a value as a Courier webhook secret.
pub const SECRET_PREFIX: &str = "whsec_";

/// Random bytes in a generated secret.
pub const SECRET_BYTES: usize = 32;

/// Source of new signing secrets.
///
/// Injected into the rotation manager so tests can produce predictable
/// secrets.
pub trait SecretGenerator: Send + Sync + std::fmt::Debug {
    /// Returns a new secret in its textual form.
    fn generate(&self) -> String;
}

/// Generates secrets from the thread-local CSPRNG, which is seeded from the
/// operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsSecretGenerator;

impl SecretGenerator for OsSecretGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; SECRET_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        format!("{SECRET_PREFIX}{}", hex::encode(bytes))
    }
}
