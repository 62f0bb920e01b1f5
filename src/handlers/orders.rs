use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    handlers::{
        common::{created_response, success_response, validate_input, AdminAccess, Caller},
        AppState,
    },
    services::orders::{CreateOrderInput, UpdateOrderStatusInput},
};

/// POST /orders
///
/// The order owner is the `x-user-id` caller; without the header the
/// order is a guest order and needs `guest_email`.
pub async fn create_order(
    State(state): State<AppState>,
    caller: Caller,
    Json(mut input): Json<CreateOrderInput>,
) -> Result<Response, ServiceError> {
    input.user_id = caller.0;
    validate_input(&input)?;
    let order = state.services.orders.create_order(input).await?;
    Ok(created_response(order))
}

/// GET /orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let order = state.services.orders.get_order(order_id).await?;
    Ok(success_response(order))
}

/// PUT /admin/orders/:id/status
pub async fn update_order_status(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(order_id): Path<Uuid>,
    Json(input): Json<UpdateOrderStatusInput>,
) -> Result<Response, ServiceError> {
    let order = state
        .services
        .orders
        .update_order_status(order_id, input)
        .await?;
    Ok(success_response(order))
}
