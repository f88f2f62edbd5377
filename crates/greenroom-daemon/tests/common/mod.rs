//! Shared helpers for gateway integration tests.
//!
//! Everything runs against the real router over `tower::ServiceExt::oneshot`
//! with an in-memory store, the deterministic AI fallback, and no code
//! interpreter.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use greenroom_core::ai::AiProxy;
use greenroom_core::codeeval::CodeEvaluator;
use greenroom_core::config::Config;
use greenroom_core::fanout::EventBus;
use greenroom_core::service::SessionService;
use greenroom_core::store::SessionStore;
use greenroom_core::token::TokenAuthority;
use greenroom_daemon::gateway::{self, AppState};
use serde_json::{Value, json};
use tower::ServiceExt;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789abcdef";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

pub fn app() -> TestApp {
    let config = Config::for_tests(TEST_SECRET).expect("test config");
    let store = Arc::new(SessionStore::in_memory().expect("in-memory store"));
    let bus = Arc::new(EventBus::new());
    let service = Arc::new(SessionService::new(
        store,
        bus,
        AiProxy::fallback_only(),
        CodeEvaluator::Unavailable,
    ));
    let authority = Arc::new(TokenAuthority::new(config.auth_secret.clone()));
    let state = AppState {
        service,
        authority,
        config: Arc::new(config),
    };
    TestApp {
        router: gateway::router(state.clone()),
        state,
    }
}

/// Issues one request and returns `(status, parsed body, set-cookie)`.
pub async fn request(
    router: &Router,
    method: &str,
    path: &str,
    bearer: Option<&str>,
    cookie: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value, Option<String>) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, format!("session={cookie}"));
    }
    let request = match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value, set_cookie)
}

/// A signed-in candidate: user bearer token plus session-cookie value.
pub struct Login {
    pub token: String,
    pub cookie: String,
}

pub async fn login(router: &Router, email: &str) -> Login {
    let (status, body, set_cookie) = request(
        router,
        "POST",
        "/auth/login",
        None,
        None,
        Some(json!({"email": email})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let cookie = set_cookie
        .expect("set-cookie")
        .split(';')
        .next()
        .and_then(|pair| pair.split_once('=').map(|(_, v)| v.to_string()))
        .expect("cookie value");
    Login {
        token: body["token"].as_str().expect("token").to_string(),
        cookie,
    }
}

pub fn session_config() -> Value {
    json!({
        "roleCategory": "QA",
        "experienceYears": 5,
        "experienceMonths": 0,
        "modes": ["behavioral"],
        "questionCount": 5,
        "durationLimit": 30,
        "language": "en-us",
        "difficulty": "adaptive",
        "companyTargets": [],
        "includeCuratedQuestions": true,
        "allowAIGenerated": true,
        "consentRecording": true,
        "consentAntiCheat": true,
        "consentTimestamp": "2025-11-02T12:00:00Z"
    })
}

/// Creates a session; returns `(session_id, ist)`.
pub async fn create_session(router: &Router, login: &Login) -> (String, String) {
    let (status, body, _) = request(
        router,
        "POST",
        "/interview/sessions",
        Some(&login.token),
        None,
        Some(session_config()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (
        body["sessionId"].as_str().expect("sessionId").to_string(),
        body["ist"].as_str().expect("ist").to_string(),
    )
}

/// Fetches an ACET via the session cookie.
pub async fn issue_acet(router: &Router, login: &Login, session_id: &str) -> String {
    let (status, body, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/token/acet"),
        None,
        Some(&login.cookie),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["acet"].as_str().expect("acet").to_string()
}

/// Builds the next chained event batch for a session by asking the server
/// for its current tail.
pub async fn chained_events(
    router: &Router,
    login: &Login,
    session_id: &str,
    types: &[&str],
) -> Vec<Value> {
    let (status, tail, _) = request(
        router,
        "GET",
        &format!("/interview/{session_id}/anti-cheat/tail"),
        Some(&login.token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let mut seq = tail["seq"].as_u64().expect("seq");
    let mut prev_hash = tail["hash"].as_str().expect("hash").to_string();

    let mut events = Vec::new();
    for event_type in types {
        seq += 1;
        let event = greenroom_core::chain::AntiCheatEvent {
            session_id: session_id.to_string(),
            seq,
            event_type: (*event_type).to_string(),
            details: json!({}),
            ts: "2025-11-02T12:00:00Z".into(),
            prev_hash: prev_hash.clone(),
        };
        prev_hash = greenroom_core::chain::event_hash(&event);
        events.push(serde_json::to_value(&event).expect("event json"));
    }
    events
}

/// Runs precheck with passing checks and a chained `FS_READY` event, then
/// `/start`; returns `(wst, aipt, upt)`.
pub async fn precheck_and_start(
    router: &Router,
    login: &Login,
    session_id: &str,
) -> (String, String, String) {
    let acet = issue_acet(router, login, session_id).await;
    let events = chained_events(router, login, session_id, &["FS_READY"]).await;
    let (status, body, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/precheck"),
        Some(&acet),
        None,
        Some(json!({
            "sessionId": session_id,
            "checks": {"camera": {"status": "pass"}, "microphone": {"status": "pass"}},
            "events": events,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["canProceed"], true);

    let (status, body, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/start"),
        None,
        Some(&login.cookie),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (
        body["wst"].as_str().expect("wst").to_string(),
        body["aipt"].as_str().expect("aipt").to_string(),
        body["upt"].as_str().expect("upt").to_string(),
    )
}

/// Requests the first question, performing the `Ready -> Active` transition.
pub async fn activate(router: &Router, aipt: &str, session_id: &str) -> Value {
    let (status, body, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/next-question"),
        Some(aipt),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body
}

/// Submits an anti-cheat batch under a fresh ACET.
pub async fn submit_events(
    router: &Router,
    login: &Login,
    session_id: &str,
    events: Vec<Value>,
) -> (StatusCode, Value) {
    let acet = issue_acet(router, login, session_id).await;
    let (status, body, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/anti-cheat"),
        Some(&acet),
        None,
        Some(json!({"sessionId": session_id, "checks": {}, "events": events})),
    )
    .await;
    (status, body)
}
