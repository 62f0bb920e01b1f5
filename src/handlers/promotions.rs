use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    handlers::{
        carts::PromotionRequest,
        common::{created_response, success_response, validate_input, AdminAccess, Caller},
        AppState,
    },
    services::promotions::CreatePromotionInput,
};

#[derive(Debug, Deserialize)]
pub struct ValidatePromotionRequest {
    pub cart_id: Uuid,
    #[serde(flatten)]
    pub promotion: PromotionRequest,
}

#[derive(Debug, Serialize)]
pub struct RecountResponse {
    pub promotion_id: Uuid,
    pub usage_count: i32,
}

/// POST /promotions/validate
///
/// Evaluates a promotion against a cart without attaching it.
pub async fn validate_promotion(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<ValidatePromotionRequest>,
) -> Result<Response, ServiceError> {
    validate_input(&request.promotion)?;
    let evaluation = state
        .services
        .carts
        .preview_promotion(
            request.cart_id,
            request.promotion.promotion_ref()?,
            request.promotion.identity(caller),
            Utc::now(),
        )
        .await?;
    Ok(success_response(evaluation))
}

/// GET /promotions/:id
pub async fn get_promotion(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let promotion = state.services.promotions.get_promotion(id).await?;
    Ok(success_response(promotion))
}

/// POST /admin/promotions
pub async fn create_promotion(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Json(input): Json<CreatePromotionInput>,
) -> Result<Response, ServiceError> {
    validate_input(&input)?;
    let promotion = state.services.promotions.create_promotion(input).await?;
    Ok(created_response(promotion))
}

/// POST /admin/promotions/:id/deactivate
pub async fn deactivate_promotion(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let promotion = state.services.promotions.deactivate_promotion(id).await?;
    Ok(success_response(promotion))
}

/// POST /admin/promotions/:id/recount
pub async fn recount_usage(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let usage_count = state.services.promotions.recount_usage(id).await?;
    Ok(success_response(RecountResponse {
        promotion_id: id,
        usage_count,
    }))
}
