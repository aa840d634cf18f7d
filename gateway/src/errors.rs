//! Crate-wide error type and its mapping onto the wire error envelope
//! `{"error":{"code":<int>,"message":"<escaped>"}}` (see external interfaces
//! and error handling design). Every branch here corresponds to one row of
//! that table; nothing maps a failure to a status code anywhere else.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,

    #[error("not found")]
    NotFound,

    #[error("service unavailable: {0}")]
    DbUnavailable(String),

    #[error("database error: {0}")]
    DbError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Status/code mapping for the error envelope. Each variant has a fixed
/// HTTP status; the `code` field mirrors it so a client need not keep a
/// second table.
impl GatewayError {
    /// The numeric HTTP status this error maps to, for callers (like the
    /// WS dispatch) that need it without building a full `Response`.
    pub fn http_status(&self) -> u16 {
        self.status().as_u16()
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidToken => StatusCode::UNAUTHORIZED,
            GatewayError::TokenExpired => StatusCode::FORBIDDEN,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::DbUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DbError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `WWW-Authenticate` challenge hint, for the variants that carry one.
    fn www_authenticate(&self) -> Option<&'static str> {
        match self {
            GatewayError::MalformedRequest(_) => Some(r#"Bearer error="invalid_request""#),
            GatewayError::Unauthenticated => Some(r#"Bearer error="unauthorized_client""#),
            GatewayError::InvalidToken => Some(r#"Bearer error="invalid_token""#),
            GatewayError::TokenExpired => Some(r#"Bearer error="invalid_token""#),
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            GatewayError::MalformedRequest(m) => m.clone(),
            GatewayError::Unauthenticated => "Access Denied.".to_string(),
            GatewayError::InvalidToken => "invalid_token".to_string(),
            GatewayError::TokenExpired => "invalid_token".to_string(),
            GatewayError::NotFound => "not found".to_string(),
            GatewayError::DbUnavailable(m) => m.clone(),
            GatewayError::DbError(m) => m.clone(),
            GatewayError::Internal(m) => m.clone(),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::error!(target: "gateway.errors", kind = ?self, status = %status, "request failed");

        let body = ErrorEnvelope {
            error: ErrorBody {
                code: status.as_u16(),
                message: self.message(),
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(challenge) = self.www_authenticate() {
            if let Ok(value) = HeaderValue::from_str(challenge) {
                response.headers_mut().insert("WWW-Authenticate", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_request_maps_to_400() {
        assert_eq!(
            GatewayError::MalformedRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn token_expired_maps_to_403() {
        assert_eq!(GatewayError::TokenExpired.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn db_unavailable_maps_to_503() {
        assert_eq!(
            GatewayError::DbUnavailable("pool exhausted".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn unauthenticated_carries_unauthorized_client_challenge() {
        assert_eq!(
            GatewayError::Unauthenticated.www_authenticate(),
            Some(r#"Bearer error="unauthorized_client""#)
        );
    }

    #[test]
    fn not_found_has_no_challenge() {
        assert_eq!(GatewayError::NotFound.www_authenticate(), None);
    }
}
