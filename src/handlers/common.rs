use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

use crate::{errors::ServiceError, ApiResponse, AppState};

/// Header carrying the upstream-authenticated customer id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the admin API token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::success(data))).into_response()
}

/// Standard no content response
pub fn no_content_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input
        .validate()
        .map_err(|e| ServiceError::ValidationError(format!("Validation failed: {}", e)))
}

/// The caller's customer id, when the gateway in front of us supplied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Option<Uuid>);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_ID_HEADER) else {
            return Ok(Caller(None));
        };
        value
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(|id| Caller(Some(id)))
            .ok_or_else(|| ServiceError::Unauthorized(format!("invalid {} header", USER_ID_HEADER)))
    }
}

/// Guards admin routes: `x-admin-token` must equal the configured token.
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess;

#[async_trait]
impl FromRequestParts<AppState> for AdminAccess {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.admin_api_token.as_deref() else {
            return Err(ServiceError::Unauthorized("admin API is disabled".to_string()));
        };
        let provided = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            Ok(AdminAccess)
        } else {
            Err(ServiceError::Unauthorized("invalid admin token".to_string()))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn constant_time_eq_matches_only_identical_input() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
    }

    #[tokio::test]
    async fn caller_header_is_optional_but_must_parse() {
        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        assert_eq!(Caller::from_request_parts(&mut parts, &()).await.unwrap(), Caller(None));

        let id = Uuid::new_v4();
        let (mut parts, _) = Request::builder()
            .header(USER_ID_HEADER, id.to_string())
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(
            Caller::from_request_parts(&mut parts, &()).await.unwrap(),
            Caller(Some(id))
        );

        let (mut parts, _) = Request::builder()
            .header(USER_ID_HEADER, "not-a-uuid")
            .body(())
            .unwrap()
            .into_parts();
        assert!(Caller::from_request_parts(&mut parts, &()).await.is_err());
    }
}
