//! Bearer-token authentication for the admin API.
//!
//! Every admin route requires `Authorization: Bearer <token>` matching the
//! configured operator token. Comparison is constant time so the token
//! cannot be recovered byte by byte through timing.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::server::AppState;

/// Errors produced by admin authentication.
#[derive(Debug)]
pub enum AuthError {
    /// The Authorization header is missing or not a bearer token.
    MissingToken,
    /// The presented token does not match the configured token.
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            Self::MissingToken => "Missing bearer token",
            Self::InvalidToken => "Invalid bearer token",
        };
        (StatusCode::UNAUTHORIZED, message).into_response()
    }
}

/// Extracts the bearer token from the Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

/// Timing-safe comparison so token bytes do not leak through latency.
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.as_bytes().iter().zip(b.as_bytes()) {
        result |= a_byte ^ b_byte;
    }
    result == 0
}

/// Axum middleware guarding the admin route group.
pub async fn admin_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let token = extract_bearer_token(req.headers()).ok_or(AuthError::MissingToken)?;

    if !timing_safe_eq(token, &state.admin_token) {
        return Err(AuthError::InvalidToken);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer ops-token-123"));

        assert_eq!(extract_bearer_token(&headers), Some("ops-token-123"));
    }

    #[test]
    fn missing_header_yields_none() {
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn basic_auth_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcjpwYXNz"));

        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn comparison_rejects_prefix_and_mismatch() {
        assert!(timing_safe_eq("ops-token", "ops-token"));
        assert!(!timing_safe_eq("ops-token", "ops-toke"));
        assert!(!timing_safe_eq("ops-token", "ops-tokex"));
    }
}
