//! Shared state for request handlers.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{storage::Storage, Clock};
use courier_delivery::DeliveryStorage;
use courier_signing::InboundVerifier;

/// Dependency check behind `/health` and `/ready`.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Returns an error message if the dependency is unavailable.
    async fn check(&self) -> Result<(), String>;
}

#[async_trait]
impl ReadinessCheck for Storage {
    async fn check(&self) -> Result<(), String> {
        self.health_check().await.map_err(|e| e.to_string())
    }
}

/// State cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Subscription lookup for inbound callbacks.
    pub storage: Arc<dyn DeliveryStorage>,
    /// Signature and replay validation for inbound callbacks.
    pub verifier: InboundVerifier,
    /// Database check.
    pub readiness: Arc<dyn ReadinessCheck>,
    /// Time source for health timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Bundles handler dependencies.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        verifier: InboundVerifier,
        readiness: Arc<dyn ReadinessCheck>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, verifier, readiness, clock }
    }
}
