use axum::{extract::State, response::Response, Json};
use serde::Deserialize;

use crate::{
    errors::ServiceError,
    handlers::{
        common::{success_response, AdminAccess},
        AppState,
    },
};

#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    /// Defaults to the configured reservation TTL
    pub max_age_hours: Option<i64>,
}

/// POST /admin/reservations/sweep
pub async fn sweep_reservations(
    State(state): State<AppState>,
    _admin: AdminAccess,
    body: Option<Json<SweepRequest>>,
) -> Result<Response, ServiceError> {
    let Json(request) = body.unwrap_or_default();
    let max_age_hours = request
        .max_age_hours
        .unwrap_or(state.config.reservation_ttl_hours);
    let result = state
        .services
        .ledger
        .cleanup_expired_reservations(max_age_hours)
        .await?;
    Ok(success_response(result))
}
