use axum::{
    extract::{Path, Query, State},
    response::Response,
};
use serde::Deserialize;

use crate::{
    errors::ServiceError,
    handlers::{common::success_response, AppState},
};

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    #[serde(default = "default_quantity")]
    pub quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

/// GET /inventory/:unit/availability?quantity=
///
/// `unit` is an inventory unit id or SKU.
pub async fn check_availability(
    State(state): State<AppState>,
    Path(unit): Path<String>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Response, ServiceError> {
    if query.quantity <= 0 {
        return Err(ServiceError::ValidationError(
            "quantity must be positive".to_string(),
        ));
    }
    let availability = state
        .services
        .ledger
        .check_availability(&unit, query.quantity)
        .await?;
    Ok(success_response(availability))
}
