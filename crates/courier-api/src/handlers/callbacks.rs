//! Inbound signed callbacks.
//!
//! A receiver calling back into Courier signs its request with the same
//! secret and headers Courier uses for outbound deliveries. The callback is
//! accepted only when the timestamp is inside the replay window and the
//! signature matches a currently active secret of the subscription. The
//! timestamp is checked first, so stale or replayed requests cost neither a
//! storage lookup nor a JSON parse.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use courier_core::SubscriptionId;
use courier_delivery::client::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::state::AppState;

/// Response for an accepted callback.
#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    /// Subscription the callback was verified against
    pub subscription_id: String,
    /// Always `accepted`
    pub status: &'static str,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Machine-readable code
    pub code: &'static str,
    /// Human-readable description
    pub message: String,
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: ErrorDetail { code, message: message.into() } }))
        .into_response()
}

fn unauthorized() -> Response {
    error_response(
        StatusCode::UNAUTHORIZED,
        "invalid_signature",
        "signature or timestamp could not be verified",
    )
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// `POST /callbacks/{subscription_id}`.
///
/// - 401: missing or stale timestamp, checked before anything else
/// - 404: unknown subscription
/// - 400: body is not JSON
/// - 401: missing signature or signature mismatch
/// - 500: storage failure or corrupt secret state
/// - 202: verified
#[instrument(
    name = "receive_callback",
    skip(state, headers, body),
    fields(subscription_id = %subscription_id, body_bytes = body.len())
)]
pub async fn receive_callback(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let subscription_id = SubscriptionId(subscription_id);
    let timestamp = header(&headers, TIMESTAMP_HEADER);

    if !state.verifier.is_fresh(timestamp) {
        warn!("callback rejected: timestamp missing or outside tolerance");
        return unauthorized();
    }

    let subscription = match state.storage.find_subscription(subscription_id).await {
        Ok(Some(subscription)) => subscription,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "subscription_not_found",
                format!("subscription {subscription_id} not found"),
            );
        },
        Err(e) => {
            error!(error = %e, "failed to load subscription");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "failed to load subscription",
            );
        },
    };

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_payload",
                format!("body is not valid JSON: {e}"),
            );
        },
    };

    let verified = state.verifier.validate_inbound(
        &payload,
        header(&headers, SIGNATURE_HEADER),
        timestamp,
        &subscription,
    );

    match verified {
        Ok(true) => {
            info!("callback verified");
            (
                StatusCode::ACCEPTED,
                Json(CallbackResponse {
                    subscription_id: subscription_id.to_string(),
                    status: "accepted",
                }),
            )
                .into_response()
        },
        Ok(false) => {
            warn!("callback rejected");
            unauthorized()
        },
        Err(e) => {
            error!(error = %e, "subscription has malformed secret state");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "subscription secret state is invalid",
            )
        },
    }
}
