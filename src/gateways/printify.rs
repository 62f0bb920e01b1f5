//! Printify REST client.
//!
//! Every request passes through a shared sliding-window limiter. A `429`
//! is retried exactly once after honouring `Retry-After`.

use async_trait::async_trait;
use metrics::counter;
use reqwest::{header::RETRY_AFTER, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{FulfillmentProvider, PodOrderRequest, PodOrderResponse, PodOrderStatus};
use crate::errors::ServiceError;
use crate::rate_limiter::SlidingWindowLimiter;
use crate::services::notifications::TrackingInfo;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

pub struct PrintifyClient {
    http: Client,
    base_url: String,
    api_token: String,
    shop_id: String,
    limiter: Arc<SlidingWindowLimiter>,
}

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Shipment {
    carrier: Option<String>,
    number: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderDetails {
    status: String,
    #[serde(default)]
    shipments: Vec<Shipment>,
}

/// Seconds to wait before retrying a throttled request.
fn retry_after(response: &Response) -> Duration {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
        .min(MAX_RETRY_AFTER)
}

/// Printify expects numeric variant ids; keep strings that are not numbers.
fn variant_value(variant_id: &str) -> Value {
    match variant_id.parse::<i64>() {
        Ok(n) => json!(n),
        Err(_) => json!(variant_id),
    }
}

impl PrintifyClient {
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        shop_id: impl Into<String>,
        limiter: Arc<SlidingWindowLimiter>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
            shop_id: shop_id.into(),
            limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/shops/{}/{}", self.base_url, self.shop_id, path)
    }

    /// Sends the request built by `build`, retrying once on `429`.
    async fn send<F>(&self, build: F) -> Result<Response, ServiceError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retried = false;
        loop {
            self.limiter.acquire().await;
            let response = build()
                .bearer_auth(&self.api_token)
                .send()
                .await
                .map_err(|e| ServiceError::ExternalServiceError(format!("Printify request failed: {}", e)))?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }
            if retried {
                counter!("storefront.printify.throttled", 1);
                return Err(ServiceError::RateLimitExceeded);
            }

            let wait = retry_after(&response);
            warn!(wait_secs = wait.as_secs(), "Printify throttled request, retrying once");
            tokio::time::sleep(wait).await;
            retried = true;
        }
    }

    async fn error_from(response: Response) -> ServiceError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ServiceError::FulfillmentFailed(format!("Printify returned {}: {}", status, body))
    }
}

#[async_trait]
impl FulfillmentProvider for PrintifyClient {
    #[instrument(skip(self, request), fields(external_id = %request.external_id))]
    async fn submit_order(
        &self,
        request: &PodOrderRequest,
    ) -> Result<PodOrderResponse, ServiceError> {
        let line_items: Vec<Value> = request
            .line_items
            .iter()
            .map(|item| {
                json!({
                    "product_id": item.product_id,
                    "variant_id": variant_value(&item.variant_id),
                    "quantity": item.quantity,
                })
            })
            .collect();

        let body = json!({
            "external_id": request.external_id,
            "label": request.label,
            "line_items": line_items,
            "shipping_method": 1,
            "send_shipping_notification": false,
            "address_to": request.address_to,
        });

        let url = self.url("orders.json");
        let response = self.send(|| self.http.post(&url).json(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let created: CreatedOrder = response
            .json()
            .await
            .map_err(|e| ServiceError::FulfillmentFailed(format!("invalid Printify response: {}", e)))?;
        info!(printify_order_id = %created.id, "Submitted Printify order");

        Ok(PodOrderResponse {
            id: created.id,
            status: created.status.unwrap_or_else(|| "pending".to_string()),
        })
    }

    #[instrument(skip(self))]
    async fn get_order_status(&self, external_id: &str) -> Result<PodOrderStatus, ServiceError> {
        let url = self.url(&format!("orders/{}.json", external_id));
        let response = self.send(|| self.http.get(&url)).await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let details: OrderDetails = response
            .json()
            .await
            .map_err(|e| ServiceError::FulfillmentFailed(format!("invalid Printify response: {}", e)))?;

        let tracking = details.shipments.into_iter().find_map(|s| {
            s.number.map(|number| TrackingInfo {
                tracking_number: number,
                carrier: s.carrier,
                tracking_url: s.url,
            })
        });

        Ok(PodOrderStatus {
            status: details.status,
            tracking,
        })
    }
}
