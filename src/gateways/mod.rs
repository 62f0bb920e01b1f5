//! Adapters for the third-party payment and print-on-demand providers.
//!
//! Services depend on the [`PaymentGateway`] and [`FulfillmentProvider`]
//! traits only; `main.rs` picks the concrete client from configuration.

pub mod paypal;
pub mod printify;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use crate::services::notifications::TrackingInfo;
use crate::services::orders::ShippingAddress;

pub use paypal::PayPalGateway;
pub use printify::PrintifyClient;

/// Provider-reported state of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureStatus {
    Completed,
    Pending,
    Declined,
    Failed,
}

impl CaptureStatus {
    /// Maps a provider status string; anything unrecognised counts as failed.
    pub fn from_provider(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "COMPLETED" => Self::Completed,
            "PENDING" | "APPROVED" | "SAVED" => Self::Pending,
            "DECLINED" | "VOIDED" => Self::Declined,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Provider capture id
    pub id: String,
    pub payer_email: Option<String>,
    pub status: CaptureStatus,
    /// Full provider response, persisted on the payment row
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Creates a provider-side order and returns its id.
    async fn create_order(
        &self,
        amount: Decimal,
        currency: &str,
        reference: &str,
    ) -> Result<String, ServiceError>;

    async fn capture_payment(&self, external_id: &str) -> Result<CaptureResult, ServiceError>;
}

/// Used when no payment credentials are configured.
#[derive(Debug, Default, Clone)]
pub struct DisabledPaymentGateway;

#[async_trait]
impl PaymentGateway for DisabledPaymentGateway {
    fn provider(&self) -> &'static str {
        "disabled"
    }

    async fn create_order(
        &self,
        _amount: Decimal,
        _currency: &str,
        _reference: &str,
    ) -> Result<String, ServiceError> {
        Err(ServiceError::PaymentFailed(
            "payment provider is not configured".to_string(),
        ))
    }

    async fn capture_payment(&self, _external_id: &str) -> Result<CaptureResult, ServiceError> {
        Err(ServiceError::PaymentFailed(
            "payment provider is not configured".to_string(),
        ))
    }
}

/// Shipping address in the shape print-on-demand providers expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAddress {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub country: String,
    pub region: String,
    pub address1: String,
    pub address2: Option<String>,
    pub city: String,
    pub zip: String,
}

impl From<&ShippingAddress> for PodAddress {
    fn from(address: &ShippingAddress) -> Self {
        Self {
            first_name: address.first_name.clone(),
            last_name: address.last_name.clone(),
            email: address.email.clone(),
            phone: address.phone.clone(),
            country: address.country.clone(),
            region: address.state.clone(),
            address1: address.address1.clone(),
            address2: address.address2.clone(),
            city: address.city.clone(),
            zip: address.postal_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodLineItem {
    pub product_id: String,
    pub variant_id: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodOrderRequest {
    /// Our reference, echoed back by the provider
    pub external_id: String,
    pub label: String,
    pub line_items: Vec<PodLineItem>,
    pub address_to: PodAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodOrderResponse {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodOrderStatus {
    pub status: String,
    pub tracking: Option<TrackingInfo>,
}

impl PodOrderStatus {
    pub fn is_shipped(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "shipped" | "fulfilled" | "delivered" | "partially-fulfilled"
        ) && self.tracking.is_some()
    }
}

#[async_trait]
pub trait FulfillmentProvider: Send + Sync {
    async fn submit_order(&self, request: &PodOrderRequest)
        -> Result<PodOrderResponse, ServiceError>;

    async fn get_order_status(&self, external_id: &str) -> Result<PodOrderStatus, ServiceError>;
}

/// Used when Printify is not configured; every submission fails so the
/// affected lines stay retryable.
#[derive(Debug, Default, Clone)]
pub struct DisabledFulfillmentProvider;

#[async_trait]
impl FulfillmentProvider for DisabledFulfillmentProvider {
    async fn submit_order(
        &self,
        _request: &PodOrderRequest,
    ) -> Result<PodOrderResponse, ServiceError> {
        Err(ServiceError::FulfillmentFailed(
            "print-on-demand provider is not configured".to_string(),
        ))
    }

    async fn get_order_status(&self, _external_id: &str) -> Result<PodOrderStatus, ServiceError> {
        Err(ServiceError::FulfillmentFailed(
            "print-on-demand provider is not configured".to_string(),
        ))
    }
}
