use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::ServiceError,
    handlers::{
        common::{created_response, no_content_response, success_response, validate_input, Caller},
        AppState,
    },
    services::{
        cart::{AddToCartInput, CreateCartInput, CustomerIdentity},
        promotions::PromotionRef,
    },
};

/// Names a promotion by coupon code or by id; exactly one is required.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PromotionRequest {
    #[validate(length(min = 1, max = 64))]
    pub coupon_code: Option<String>,
    pub promotion_id: Option<Uuid>,
    #[validate(email)]
    pub guest_email: Option<String>,
}

impl PromotionRequest {
    pub fn promotion_ref(&self) -> Result<PromotionRef, ServiceError> {
        match (&self.coupon_code, self.promotion_id) {
            (Some(code), None) => Ok(PromotionRef::Code(code.clone())),
            (None, Some(id)) => Ok(PromotionRef::Id(id)),
            _ => Err(ServiceError::ValidationError(
                "exactly one of coupon_code or promotion_id is required".to_string(),
            )),
        }
    }

    pub fn identity(&self, caller: Caller) -> CustomerIdentity {
        CustomerIdentity {
            user_id: caller.0,
            guest_email: self.guest_email.clone(),
        }
    }
}

/// POST /carts
///
/// Ownership comes only from the `x-user-id` header; a `user_id` in the
/// body is ignored.
pub async fn create_cart(
    State(state): State<AppState>,
    caller: Caller,
    Json(mut input): Json<CreateCartInput>,
) -> Result<Response, ServiceError> {
    validate_input(&input)?;
    input.user_id = caller.0;
    let cart = state.services.carts.create_cart(input).await?;
    Ok(created_response(cart))
}

/// GET /carts/:id
pub async fn get_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let cart = state.services.carts.get_cart(cart_id).await?;
    Ok(success_response(cart))
}

/// POST /carts/:id/items
pub async fn add_item(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    Json(input): Json<AddToCartInput>,
) -> Result<Response, ServiceError> {
    validate_input(&input)?;
    let cart = state.services.carts.add_item(cart_id, input).await?;
    Ok(success_response(cart))
}

/// DELETE /carts/:id/items/:item_id
pub async fn remove_item(
    State(state): State<AppState>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, ServiceError> {
    let cart = state.services.carts.remove_item(cart_id, item_id).await?;
    Ok(success_response(cart))
}

/// POST /carts/:id/promotions
pub async fn apply_promotion(
    State(state): State<AppState>,
    caller: Caller,
    Path(cart_id): Path<Uuid>,
    Json(request): Json<PromotionRequest>,
) -> Result<Response, ServiceError> {
    validate_input(&request)?;
    let evaluation = state
        .services
        .carts
        .apply_promotion(
            cart_id,
            request.promotion_ref()?,
            request.identity(caller),
            Utc::now(),
        )
        .await?;
    Ok(success_response(evaluation))
}

/// DELETE /carts/:id/promotions/:promotion_id
pub async fn remove_promotion(
    State(state): State<AppState>,
    Path((cart_id, promotion_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, ServiceError> {
    state
        .services
        .carts
        .remove_promotion(cart_id, promotion_id)
        .await?;
    Ok(no_content_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn request(code: Option<&str>, id: Option<Uuid>) -> PromotionRequest {
        PromotionRequest {
            coupon_code: code.map(str::to_string),
            promotion_id: id,
            guest_email: None,
        }
    }

    #[test]
    fn promotion_request_needs_exactly_one_reference() {
        let id = Uuid::new_v4();
        assert_eq!(
            request(Some("TEST20"), None).promotion_ref().unwrap(),
            PromotionRef::Code("TEST20".to_string())
        );
        assert_eq!(request(None, Some(id)).promotion_ref().unwrap(), PromotionRef::Id(id));
        assert_matches!(
            request(None, None).promotion_ref(),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            request(Some("TEST20"), Some(id)).promotion_ref(),
            Err(ServiceError::ValidationError(_))
        );
    }
}
