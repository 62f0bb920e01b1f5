use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{CaptureResult, CaptureStatus, PaymentGateway};
use crate::errors::ServiceError;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// PayPal Orders v2 client using client-credentials OAuth2.
pub struct PayPalGateway {
    http: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalGateway {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, ServiceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("PayPal auth request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::ExternalServiceError(format!(
                "PayPal auth failed ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("invalid PayPal token response: {}", e)))?;

        // Refresh a minute early
        let expires_at = Utc::now() + ChronoDuration::seconds((token.expires_in - 60).max(0));
        debug!(%expires_at, "Obtained PayPal access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    async fn post_json(&self, path: &str, body: Option<Value>) -> Result<(StatusCode, Value), ServiceError> {
        let token = self.access_token().await?;
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("PayPal request failed: {}", e)))?;
        let status = response.status();
        let payload = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, payload))
    }
}

/// Pulls the capture id, status and payer email out of a capture response.
fn parse_capture(payload: Value) -> Result<CaptureResult, ServiceError> {
    let capture = payload
        .pointer("/purchase_units/0/payments/captures/0")
        .cloned()
        .unwrap_or(Value::Null);

    let id = capture
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| payload.get("id").and_then(Value::as_str))
        .ok_or_else(|| ServiceError::ExternalServiceError("PayPal capture response has no id".to_string()))?
        .to_string();

    let status = capture
        .get("status")
        .and_then(Value::as_str)
        .or_else(|| payload.get("status").and_then(Value::as_str))
        .map(CaptureStatus::from_provider)
        .unwrap_or(CaptureStatus::Failed);

    let payer_email = payload
        .pointer("/payer/email_address")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(CaptureResult {
        id,
        payer_email,
        status,
        raw: payload,
    })
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn provider(&self) -> &'static str {
        "paypal"
    }

    #[instrument(skip(self))]
    async fn create_order(
        &self,
        amount: Decimal,
        currency: &str,
        reference: &str,
    ) -> Result<String, ServiceError> {
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": reference,
                "amount": {
                    "currency_code": currency,
                    "value": format!("{:.2}", amount),
                }
            }]
        });

        let (status, payload) = self.post_json("/v2/checkout/orders", Some(body)).await?;
        if !status.is_success() {
            warn!(%status, "PayPal order creation rejected");
            return Err(ServiceError::PaymentFailed(format!(
                "PayPal rejected order creation ({})",
                status
            )));
        }

        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::ExternalServiceError("PayPal order response has no id".to_string()))?;
        info!(external_id = %id, "PayPal order created");
        Ok(id.to_string())
    }

    #[instrument(skip(self))]
    async fn capture_payment(&self, external_id: &str) -> Result<CaptureResult, ServiceError> {
        let path = format!("/v2/checkout/orders/{}/capture", external_id);
        let (status, payload) = self.post_json(&path, None).await?;

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            let issue = payload
                .pointer("/details/0/issue")
                .and_then(Value::as_str)
                .unwrap_or("UNPROCESSABLE_ENTITY");
            return Err(ServiceError::PaymentFailed(format!("PayPal capture refused: {}", issue)));
        }
        if !status.is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "PayPal capture failed ({})",
                status
            )));
        }

        parse_capture(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completed_capture() {
        let payload = json!({
            "id": "ORDER-1",
            "status": "COMPLETED",
            "payer": { "email_address": "buyer@example.com" },
            "purchase_units": [{
                "payments": { "captures": [{ "id": "CAP-9", "status": "COMPLETED" }] }
            }]
        });

        let capture = parse_capture(payload).unwrap();
        assert_eq!(capture.id, "CAP-9");
        assert_eq!(capture.status, CaptureStatus::Completed);
        assert_eq!(capture.payer_email.as_deref(), Some("buyer@example.com"));
    }

    #[test]
    fn capture_without_id_is_an_error() {
        assert!(parse_capture(json!({ "status": "COMPLETED" })).is_err());
    }
}
