// =============================================================================
// Bearer Token Authentication: Axum extractor
// =============================================================================
//
// Validates `Authorization: Bearer <token>` against the admin token loaded
// from `EXIT_ENGINE_ADMIN_TOKEN` at startup (held in `EngineState`).
// Comparison is constant time. With no token configured every
// authenticated request is refused.
//
//   async fn handler(_auth: AuthBearer, State(state): State<Arc<EngineState>>)
//
// =============================================================================

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::EngineState;

/// Compare two byte slices in constant time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check a presented header value against the expected token.
fn check(header: Option<&str>, expected: Option<&str>) -> Result<String, AuthRejection> {
    let Some(expected) = expected else {
        warn!("admin token not configured, rejecting authenticated request");
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "server authentication not configured",
        });
    };

    let Some(token) = header.and_then(|v| v.strip_prefix("Bearer ")) else {
        warn!("missing or malformed Authorization header");
        return Err(AuthRejection {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid authorization token",
        });
    };

    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        warn!("invalid admin token presented");
        return Err(AuthRejection {
            status: StatusCode::FORBIDDEN,
            message: "invalid authorization token",
        });
    }
    Ok(token.to_string())
}

/// Proof that the request carried the admin token.
pub struct AuthBearer(pub String);

#[derive(Debug)]
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl FromRequestParts<Arc<EngineState>> for AuthBearer {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<EngineState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        check(header, state.admin_token.as_deref()).map(AuthBearer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_cases() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer_string"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[test]
    fn accepts_matching_bearer() {
        assert_eq!(check(Some("Bearer s3cret"), Some("s3cret")).unwrap(), "s3cret");
    }

    #[test]
    fn rejects_missing_config_and_bad_tokens() {
        assert_eq!(
            check(Some("Bearer x"), None).unwrap_err().status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            check(None, Some("s3cret")).unwrap_err().status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            check(Some("Basic s3cret"), Some("s3cret")).unwrap_err().status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            check(Some("Bearer wrong"), Some("s3cret")).unwrap_err().status,
            StatusCode::FORBIDDEN
        );
    }
}
