//! Admin token middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingAuth,
    InvalidAuthFormat,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingAuth => "Authentication required",
            AuthError::InvalidAuthFormat => "Invalid authentication format",
            AuthError::InvalidToken => "Invalid token",
        };
        let status = StatusCode::UNAUTHORIZED;

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Extract the bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Result<&str, AuthError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthFormat)?;
    header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidAuthFormat)
}

/// Constant-time so response timing does not leak how much of the token matched
pub fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

/// Middleware that requires the admin bearer token
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let path = request.uri().path().to_string();

    let token = extract_bearer_token(&request).inspect_err(|e| {
        tracing::warn!(path = %path, reason = ?e, "require_admin: no usable credentials");
    })?;

    if !token_matches(token, &state.admin_token) {
        tracing::warn!(path = %path, "require_admin: token rejected");
        return Err(AuthError::InvalidToken);
    }

    Ok(next.run(request).await)
}
