use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::ServiceError,
    handlers::{
        common::{created_response, success_response, validate_input},
        AppState,
    },
};

#[derive(Debug, Deserialize, Validate)]
pub struct CapturePaymentRequest {
    /// Provider order id returned when the payment was initiated
    #[validate(length(min = 1, max = 128))]
    pub external_id: String,
}

/// POST /orders/:id/payments
pub async fn initiate_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let payment = state.services.payments.initiate_payment(order_id).await?;
    Ok(created_response(payment))
}

/// POST /orders/:id/payments/capture
pub async fn capture_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<CapturePaymentRequest>,
) -> Result<Response, ServiceError> {
    validate_input(&request)?;
    let outcome = state
        .services
        .payments
        .capture_payment(order_id, &request.external_id)
        .await?;
    Ok(success_response(outcome))
}
