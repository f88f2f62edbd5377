//! Session management routes: creation, reads, and token issuance.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use greenroom_core::session::{SessionConfig, SessionState};
use greenroom_core::token::Audience;
use serde_json::json;

use super::AppState;
use super::auth::{Tokens, require, require_cookie};
use super::error::ApiError;

/// `POST /interview/sessions` (User): create a session, return its IST.
pub(super) async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<SessionConfig>,
) -> Result<Response, ApiError> {
    let claims = require(&state, &headers, Audience::User, None)?;
    let session = state.service.create_session(&claims.sub, &config)?;
    let ist = Tokens::ist(
        &state.authority,
        &claims.sub,
        &session.id,
        state.config.ttl_session_token,
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "sessionId": session.id,
            "ist": ist,
            "nextStep": "precheck",
        })),
    )
        .into_response())
}

/// `GET /interview/sessions` (User): list own session ids, newest first.
pub(super) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = require(&state, &headers, Audience::User, None)?;
    let sessions = state.service.list_sessions(&claims.sub)?;
    Ok(Json(json!({"sessions": sessions})))
}

/// `POST /interview/:id/token/acet` (session cookie).
pub(super) async fn issue_acet(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = require_cookie(&state, &headers)?;
    let session = state.service.get_owned_session(&claims.sub, &session_id)?;
    let acet = Tokens::acet(
        &state.authority,
        &session.user_id,
        &session.id,
        state.config.ttl_session_token,
    );
    Ok(Json(json!({"acet": acet})))
}

/// `POST /interview/:id/token/aipt` (session cookie). Only meaningful while
/// the interview can still ask questions.
pub(super) async fn issue_aipt(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = require_cookie(&state, &headers)?;
    let session = state.service.get_owned_session(&claims.sub, &session_id)?;
    if !matches!(session.state, SessionState::Ready | SessionState::Active) {
        return Err(ApiError::Service(
            greenroom_core::service::ServiceError::InvalidState {
                state: session.state,
            },
        ));
    }
    let aipt = Tokens::aipt(&state.authority, &session, state.config.ttl_session_token);
    Ok(Json(json!({"aipt": aipt})))
}

/// `POST /interview/:id/token/refresh` (session cookie).
///
/// Returns only the tokens still applicable in the current state: an IST for
/// any live session, a WST additionally while `Active` or `Paused`. A
/// terminal session gets an empty object; refresh never revives it.
pub(super) async fn refresh(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = require_cookie(&state, &headers)?;
    let session = state.service.get_owned_session(&claims.sub, &session_id)?;

    let mut body = json!({});
    if !session.state.is_terminal() {
        body["ist"] = json!(Tokens::ist(
            &state.authority,
            &session.user_id,
            &session.id,
            state.config.ttl_session_token,
        ));
        if matches!(session.state, SessionState::Active | SessionState::Paused) {
            body["wst"] = json!(Tokens::wst(
                &state.authority,
                &session.user_id,
                &session.id,
                state.config.ttl_session_token,
            ));
        }
    }
    Ok(Json(body))
}

/// `GET /interview/:id/anti-cheat/tail` (User).
pub(super) async fn anti_cheat_tail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = require(&state, &headers, Audience::User, None)?;
    let session = state.service.get_owned_session(&claims.sub, &session_id)?;
    Ok(Json(json!({
        "seq": session.tail.seq,
        "hash": session.tail.hash,
    })))
}

/// `GET /interview/:id/summary` (User).
pub(super) async fn summary(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = require(&state, &headers, Audience::User, None)?;
    state.service.get_owned_session(&claims.sub, &session_id)?;
    let (_, document) = state.service.summary(&session_id)?;
    Ok(Json(json!({
        "sessionId": session_id,
        "rubric": document.get("rubric").cloned().unwrap_or_default(),
        "strengths": document.get("strengths").cloned().unwrap_or_default(),
        "gaps": document.get("gaps").cloned().unwrap_or_default(),
        "scoreBreakdown": document.get("scoreBreakdown").cloned().unwrap_or_default(),
        "antiCheat": document.get("antiCheat").cloned().unwrap_or_default(),
    })))
}

/// `GET /interview/:id/review` (User).
pub(super) async fn review(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = require(&state, &headers, Audience::User, None)?;
    state.service.get_owned_session(&claims.sub, &session_id)?;
    let items = state.service.review(&session_id)?;
    Ok(Json(json!({"items": items})))
}

/// `GET /interview/:id/state` (User).
pub(super) async fn session_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = require(&state, &headers, Audience::User, None)?;
    let session = state.service.get_owned_session(&claims.sub, &session_id)?;
    Ok(Json(json!({
        "state": session.state.as_str(),
        "askedCount": session.asked_count,
    })))
}
