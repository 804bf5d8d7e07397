//! HTTP client for signed webhook delivery.
//!
//! Builds the outbound POST with the signature headers and interprets
//! transport failures. Status interpretation is left to the dispatcher.

use std::time::Duration;

use bytes::Bytes;
use courier_core::{DeliveryId, SubscriptionId};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the hex HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the Unix timestamp of the attempt.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Header carrying the subscription ID.
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-Id";

/// User agent sent with every delivery.
pub const USER_AGENT: &str = "Courier-Webhook/1.0";

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_CAPTURED_SIZE: usize = 1024;
const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout used when a request does not carry its own.
    pub default_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            user_agent: USER_AGENT.to_string(),
            max_redirects: 3,
        }
    }
}

/// HTTP client shared by all workers. Cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// A fully prepared outbound delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Record being attempted.
    pub delivery_id: DeliveryId,
    /// Subscription sent as `X-Webhook-Id`.
    pub subscription_id: SubscriptionId,
    /// Destination URL.
    pub url: String,
    /// Canonical JSON body, exactly the bytes that were signed.
    pub body: Bytes,
    /// Hex signature of `body`.
    pub signature: String,
    /// Unix seconds sent as `X-Webhook-Timestamp`.
    pub timestamp: i64,
    /// Per-attempt timeout from the subscription.
    pub timeout: Duration,
    /// Attempt number (1-based), for logging only.
    pub attempt_number: u32,
}

/// Response from a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated when oversized.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status is 2xx.
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.default_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Sends a signed delivery.
    ///
    /// Any HTTP response, including 4xx and 5xx, is returned as `Ok`.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request exceeds `request.timeout`
    /// - `Network` for connection and other transport failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            subscription_id = %request.subscription_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!(body_bytes = request.body.len(), "sending webhook");

            let http_request = self
                .client
                .post(&request.url)
                .timeout(request.timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, &request.signature)
                .header(TIMESTAMP_HEADER, request.timestamp.to_string())
                .header(WEBHOOK_ID_HEADER, request.subscription_id.to_string())
                .body(request.body.clone());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(request.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let duration = start_time.elapsed();
            let delivery_response = read_response(response, duration).await;

            tracing::debug!(
                status = delivery_response.status_code,
                duration_ms = duration.as_millis(),
                "received response"
            );

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

async fn read_response(response: Response, duration: Duration) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();

    let body = match read_capped(response).await {
        Ok(bytes) => capture_body(&bytes),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            format!("[failed to read response body: {e}]")
        },
    };

    DeliveryResponse { status_code, body, duration, is_success }
}

/// Reads at most `MAX_RESPONSE_BODY_SIZE + 1` bytes, enough for
/// [`capture_body`] to tell an oversized body apart. The rest of the body is
/// never buffered.
async fn read_capped(mut response: Response) -> reqwest::Result<Vec<u8>> {
    let limit = MAX_RESPONSE_BODY_SIZE + 1;
    let mut body = Vec::new();

    while let Some(chunk) = response.chunk().await? {
        let take = chunk.len().min(limit - body.len());
        body.extend_from_slice(&chunk[..take]);
        if body.len() >= limit {
            break;
        }
    }

    Ok(body)
}

/// Keeps bodies up to 64 KiB verbatim; larger bodies are cut to 1 KiB
/// including the truncation suffix.
pub fn capture_body(bytes: &[u8]) -> String {
    if bytes.len() > MAX_RESPONSE_BODY_SIZE {
        let max_content = MAX_CAPTURED_SIZE - TRUNCATION_SUFFIX.len();
        let truncated = String::from_utf8_lossy(&bytes[..max_content]);
        format!("{truncated}{TRUNCATION_SUFFIX}")
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
