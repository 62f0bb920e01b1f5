use axum::{
    extract::{Path, State},
    response::Response,
};
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    handlers::{
        common::{success_response, AdminAccess},
        AppState,
    },
};

/// POST /admin/orders/:id/fulfillment
pub async fn process_order(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(order_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let report = state.services.fulfillment.process_order(order_id).await?;
    Ok(success_response(report))
}

/// POST /admin/orders/:id/fulfillment/retry
pub async fn retry_failed_fulfillment(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(order_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let report = state
        .services
        .fulfillment
        .retry_failed_fulfillment(order_id)
        .await?;
    Ok(success_response(report))
}

/// POST /admin/orders/:id/fulfillment/sync-tracking
pub async fn sync_tracking(
    State(state): State<AppState>,
    _admin: AdminAccess,
    Path(order_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    let order = state.services.fulfillment.sync_tracking(order_id).await?;
    Ok(success_response(order))
}
