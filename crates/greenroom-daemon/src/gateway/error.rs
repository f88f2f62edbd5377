//! Wire error taxonomy.
//!
//! Component errors are mapped to stable error kinds exactly once, here.
//! Client-visible bodies are `{"error": {"kind", "message", "details"?}}`;
//! provider and store failure strings never pass through verbatim.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use greenroom_core::service::ServiceError;
use greenroom_core::token::TokenError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Gateway-level request failures.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid session cookie.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Token authority rejection.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Component failure, already typed by the service layer.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Malformed request body.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unexpected gateway-side failure (I/O, serialization).
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    /// The stable error kind string.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Token(err) => match err {
                TokenError::Missing => "token_missing",
                TokenError::Invalid => "token_invalid",
                TokenError::Expired => "token_expired",
                TokenError::WrongAudience { .. } => "token_wrong_audience",
                TokenError::WrongSession => "token_wrong_session",
                TokenError::AlreadyUsed => "token_already_used",
            },
            Self::Service(err) => match err {
                ServiceError::Validation(_) => "validation_failed",
                ServiceError::NotFound { .. } => "not_found",
                ServiceError::InvalidState { .. } => "invalid_state",
                ServiceError::AlreadyExists => "already_exists",
                ServiceError::ChainBroken { .. } => "chain_broken",
                ServiceError::RateLimited => "rate_limited",
                ServiceError::Internal(_) => "internal",
            },
            Self::Validation(_) => "validation_failed",
            Self::Internal(_) => "internal",
        }
    }

    /// The HTTP status for this error's family.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Token(err) => match err {
                TokenError::Missing | TokenError::Invalid | TokenError::Expired => {
                    StatusCode::UNAUTHORIZED
                }
                TokenError::WrongAudience { .. }
                | TokenError::WrongSession
                | TokenError::AlreadyUsed => StatusCode::FORBIDDEN,
            },
            Self::Service(err) => match err {
                ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
                ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
                ServiceError::InvalidState { .. }
                | ServiceError::AlreadyExists
                | ServiceError::ChainBroken { .. } => StatusCode::CONFLICT,
                ServiceError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = self.status();

        // Internal failures are logged with full detail and surfaced opaque.
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(kind, error = ?self, "request failed");
        }
        let message = if kind == "internal" {
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let mut body = json!({"error": {"kind": kind, "message": message}});
        if let Self::Service(ServiceError::ChainBroken { tail }) = &self {
            body["error"]["details"] = json!({"seq": tail.seq, "hash": tail.hash});
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenroom_core::chain::Tail;
    use greenroom_core::session::SessionState;

    #[test]
    fn test_token_kind_mapping() {
        assert_eq!(ApiError::Token(TokenError::Missing).kind(), "token_missing");
        assert_eq!(
            ApiError::Token(TokenError::WrongSession).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Token(TokenError::Expired).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_service_kind_mapping() {
        assert_eq!(
            ApiError::Service(ServiceError::InvalidState {
                state: SessionState::Ended
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Service(ServiceError::RateLimited).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Service(ServiceError::NotFound { kind: "session" }).kind(),
            "not_found"
        );
    }

    #[test]
    fn test_chain_broken_carries_tail_details() {
        let err = ApiError::Service(ServiceError::ChainBroken {
            tail: Tail {
                seq: 4,
                hash: "abcd".into(),
            },
        });
        assert_eq!(err.kind(), "chain_broken");
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
