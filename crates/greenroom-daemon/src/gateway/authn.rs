//! Sign-in.
//!
//! A single email-based sign-in drives the state machine: the response
//! carries the long-lived user capability and sets the HttpOnly session
//! cookie used by the cookie-authenticated endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::AppState;
use super::auth::{Tokens, session_cookie_header};
use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub(super) struct LoginRequest {
    email: String,
    #[serde(default)]
    #[allow(dead_code)]
    name: Option<String>,
}

/// `POST /auth/login`
pub(super) async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let email = body.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation("a valid email is required".into()));
    }

    let token = Tokens::user(&state.authority, &email, state.config.ttl_user);
    let cookie_token = Tokens::cookie(&state.authority, &email, state.config.ttl_user);
    let cookie = session_cookie_header(
        &cookie_token,
        state.config.cookie_secure,
        state.config.ttl_user.as_secs(),
    );

    info!(user_id = %email, "login");

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        headers.insert(header::SET_COOKIE, value);
    }
    Ok((headers, Json(json!({"token": token}))).into_response())
}
