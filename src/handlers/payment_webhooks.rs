use axum::{extract::State, http::HeaderMap, response::Response};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    errors::ServiceError,
    handlers::{common::success_response, AppState},
    services::payments::{capture_from_webhook, verify_webhook_signature},
};

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /payments/webhook
///
/// Declined captures and captures for cancelled orders are acknowledged so
/// the provider stops redelivering; any other failure is returned so it
/// retries.
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    if let Some(secret) = state.config.payment_webhook_secret.as_deref() {
        let (Some(timestamp), Some(signature)) = (
            header(&headers, TIMESTAMP_HEADER),
            header(&headers, SIGNATURE_HEADER),
        ) else {
            warn!("Payment webhook missing signature headers");
            return Err(ServiceError::Unauthorized(
                "missing webhook signature".to_string(),
            ));
        };
        verify_webhook_signature(
            secret,
            timestamp,
            signature,
            &body,
            state.config.payment_webhook_tolerance_secs,
            chrono::Utc::now().timestamp(),
        )
        .map_err(|e| {
            warn!(error = %e, "Payment webhook signature verification failed");
            e
        })?;
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("invalid webhook payload: {}", e)))?;

    let Some((external_id, capture)) = capture_from_webhook(&payload) else {
        let event_type = payload.get("event_type").and_then(Value::as_str).unwrap_or("");
        info!(event_type, "Ignoring payment webhook");
        return Ok(success_response(WebhookAck { status: "ignored" }));
    };

    match state
        .services
        .payments
        .handle_capture_event(&external_id, capture)
        .await
    {
        Ok(_) => Ok(success_response(WebhookAck { status: "processed" })),
        Err(ServiceError::PaymentFailed(reason)) => {
            info!(external_id = %external_id, reason = %reason, "Recorded failed capture from webhook");
            Ok(success_response(WebhookAck { status: "acknowledged" }))
        }
        Err(ServiceError::InvalidStatus(reason)) => {
            warn!(external_id = %external_id, reason = %reason, "Capture for an order that cannot proceed");
            Ok(success_response(WebhookAck { status: "refund_required" }))
        }
        Err(e) => Err(e),
    }
}
