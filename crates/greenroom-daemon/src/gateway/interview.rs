//! Interview flow routes: pre-check, start, questions, answers, code eval,
//! anti-cheat ingestion, finalize.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use greenroom_core::chain::AntiCheatEvent;
use greenroom_core::codeeval::CodeTest;
use greenroom_core::token::Audience;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use super::auth::{Tokens, check_generation, require, require_cookie};
use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub(super) struct EventBatchRequest {
    #[serde(rename = "sessionId")]
    #[allow(dead_code)]
    session_id: Option<String>,
    #[serde(default)]
    checks: Value,
    #[serde(default)]
    events: Vec<AntiCheatEvent>,
}

/// `POST /interview/:id/precheck` (ACET). Events are persisted through the
/// engine first; the check roll-up decides `canProceed`.
pub(super) async fn precheck(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<EventBatchRequest>,
) -> Result<Json<Value>, ApiError> {
    require(&state, &headers, Audience::Acet, Some(&session_id))?;
    let outcome = state
        .service
        .submit_precheck(&session_id, &body.checks, &body.events)
        .await?;
    Ok(Json(json!({
        "precheckId": outcome.precheck_id,
        "sessionId": session_id,
        "overallStatus": outcome.overall_status,
        "canProceed": outcome.can_proceed,
    })))
}

/// `POST /interview/:id/start` (session cookie). Issues the interview-phase
/// capabilities; the `Ready -> Active` transition itself happens on the
/// first `/next-question`.
pub(super) async fn start(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let claims = require_cookie(&state, &headers)?;
    state.service.get_owned_session(&claims.sub, &session_id)?;
    let session = state.service.ensure_ready(&session_id)?;

    let ttl = state.config.ttl_session_token;
    Ok(Json(json!({
        "wst": Tokens::wst(&state.authority, &session.user_id, &session.id, ttl),
        "aipt": Tokens::aipt(&state.authority, &session, ttl),
        "upt": Tokens::upt(&state.authority, &session, ttl),
        "nextStep": "interview",
    })))
}

/// `POST /interview/:id/next-question` (AIPT, generation-checked).
pub(super) async fn next_question(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let claims = require(&state, &headers, Audience::Aipt, Some(&session_id))?;
    let session = state.service.get_session(&session_id)?;
    check_generation(&claims, &session)?;

    let (question, total) = state.service.next_question(&session_id).await?;
    Ok(Json(json!({
        "questionId": question.id,
        "questionNumber": question.ordinal,
        "totalQuestions": total,
        "type": question.question_type,
        "text": question.text,
        "metadata": question.metadata,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AnswerRequest {
    question_id: String,
    answer_type: String,
    #[serde(default)]
    time_spent: Option<u32>,
    #[serde(flatten)]
    payload: serde_json::Map<String, Value>,
}

/// `POST /interview/:id/answer` (IST).
pub(super) async fn answer(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AnswerRequest>,
) -> Result<Json<Value>, ApiError> {
    require(&state, &headers, Audience::Ist, Some(&session_id))?;
    if !matches!(
        body.answer_type.as_str(),
        "voice" | "text" | "code" | "mcq" | "fib"
    ) {
        return Err(ApiError::Validation(format!(
            "unknown answer type {:?}",
            body.answer_type
        )));
    }

    let outcome = state
        .service
        .submit_answer(
            &session_id,
            &body.question_id,
            &body.answer_type,
            &Value::Object(body.payload),
            body.time_spent,
        )
        .await?;

    let mut response = json!({"status": "submitted"});
    if let Some(feedback) = outcome.immediate_feedback {
        response["immediateFeedback"] = feedback;
    }
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CodeEvalRequest {
    code: String,
    function_name: String,
    #[serde(default)]
    tests: Vec<CodeTest>,
}

/// `POST /interview/:id/code-eval` (IST).
pub(super) async fn code_eval(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CodeEvalRequest>,
) -> Result<Json<Value>, ApiError> {
    require(&state, &headers, Audience::Ist, Some(&session_id))?;
    let results = state
        .service
        .code_eval(&session_id, &body.code, &body.function_name, &body.tests)
        .await?;
    let passed = results.iter().filter(|r| r.pass).count();
    let total = results.len();
    Ok(Json(json!({
        "results": results,
        "passed": passed,
        "total": total,
    })))
}

/// `POST /interview/:id/anti-cheat` (ACET).
pub(super) async fn anti_cheat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<EventBatchRequest>,
) -> Result<Json<Value>, ApiError> {
    require(&state, &headers, Audience::Acet, Some(&session_id))?;
    let outcome = state
        .service
        .submit_anticheat(&session_id, &body.events)
        .await?;
    Ok(Json(json!({
        "tailSeq": outcome.tail.seq,
        "tailHash": outcome.tail.hash,
    })))
}

/// `POST /interview/:id/finalize` (IST).
pub(super) async fn finalize(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require(&state, &headers, Audience::Ist, Some(&session_id))?;
    let (summary_id, final_state) = state.service.finalize(&session_id).await?;
    Ok(Json(json!({
        "summaryId": summary_id,
        "status": final_state.as_str(),
    })))
}
