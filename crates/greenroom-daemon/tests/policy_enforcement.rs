//! Strike-policy behavior over the HTTP surface: auto-end on screenshot,
//! auto-pause with rescission, and token invalidation on leaving `Active`.

mod common;

use axum::http::StatusCode;
use common::{
    activate, app, chained_events, create_session, login, precheck_and_start, request,
    submit_events,
};
use greenroom_core::fanout::SessionEvent;
use serde_json::json;

#[tokio::test]
async fn screenshot_attempt_ends_session_immediately() {
    let test_app = app();
    let router = &test_app.router;
    let user = login(router, "alex@example.com").await;
    let (session_id, ist) = create_session(router, &user).await;
    let (_, aipt, _) = precheck_and_start(router, &user, &session_id).await;
    activate(router, &aipt, &session_id).await;

    let (_, mut rx) = test_app.state.service.bus().subscribe(&session_id, None);

    let events = chained_events(router, &user, &session_id, &["SCREENSHOT_ATTEMPT"]).await;
    let (status, _) = submit_events(router, &user, &session_id, events).await;
    assert_eq!(status, StatusCode::OK);

    let (_, state_body, _) = request(
        router,
        "GET",
        &format!("/interview/{session_id}/state"),
        Some(&user.token),
        None,
        None,
    )
    .await;
    assert_eq!(state_body["state"], "Ended");

    // One major strike, then the terminal frame, then stream closure.
    let first = rx.recv().await.unwrap();
    match first.event {
        SessionEvent::StrikeCreated {
            severity, action, ..
        } => {
            assert_eq!(severity, "major");
            assert_eq!(action, "end");
        }
        other => panic!("expected STRIKE_CREATED, got {other:?}"),
    }
    assert!(matches!(
        rx.recv().await.unwrap().event,
        SessionEvent::SessionEnded { .. }
    ));
    assert!(rx.recv().await.is_none());

    // Subsequent answers fail with invalid_state.
    let (status, body, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/answer"),
        Some(&ist),
        None,
        Some(json!({
            "questionId": "whatever",
            "answerType": "text",
            "responseText": "too late",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "invalid_state");
}

#[tokio::test]
async fn fs_exit_pauses_and_fs_ready_resumes() {
    let test_app = app();
    let router = &test_app.router;
    let user = login(router, "alex@example.com").await;
    let (session_id, _) = create_session(router, &user).await;
    let (_, aipt, _) = precheck_and_start(router, &user, &session_id).await;
    activate(router, &aipt, &session_id).await;

    let (_, mut rx) = test_app.state.service.bus().subscribe(&session_id, None);

    let events = chained_events(router, &user, &session_id, &["FS_EXIT"]).await;
    let (status, _) = submit_events(router, &user, &session_id, events).await;
    assert_eq!(status, StatusCode::OK);

    let (_, state_body, _) = request(
        router,
        "GET",
        &format!("/interview/{session_id}/state"),
        Some(&user.token),
        None,
        None,
    )
    .await;
    assert_eq!(state_body["state"], "Paused");

    let resume = chained_events(router, &user, &session_id, &["FS_READY"]).await;
    let (status, _) = submit_events(router, &user, &session_id, resume).await;
    assert_eq!(status, StatusCode::OK);

    let (_, state_body, _) = request(
        router,
        "GET",
        &format!("/interview/{session_id}/state"),
        Some(&user.token),
        None,
        None,
    )
    .await;
    assert_eq!(state_body["state"], "Active");

    let kinds: Vec<&str> = [
        rx.recv().await.unwrap().event.kind(),
        rx.recv().await.unwrap().event.kind(),
        rx.recv().await.unwrap().event.kind(),
    ]
    .to_vec();
    assert_eq!(
        kinds,
        vec!["STRIKE_CREATED", "SESSION_PAUSED", "SESSION_RESUMED"]
    );
}

#[tokio::test]
async fn pause_invalidates_outstanding_aipt() {
    let test_app = app();
    let router = &test_app.router;
    let user = login(router, "alex@example.com").await;
    let (session_id, _) = create_session(router, &user).await;
    let (_, aipt, _) = precheck_and_start(router, &user, &session_id).await;

    // The AIPT works while Active.
    let (status, _, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/next-question"),
        Some(&aipt),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Pause bumps the generation; the old AIPT is dead even after resume.
    let events = chained_events(router, &user, &session_id, &["FS_EXIT"]).await;
    submit_events(router, &user, &session_id, events).await;
    let resume = chained_events(router, &user, &session_id, &["FS_READY"]).await;
    submit_events(router, &user, &session_id, resume).await;

    let (status, body, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/next-question"),
        Some(&aipt),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "token_expired");

    // A re-issued AIPT carries the new generation and works.
    let (status, body, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/token/aipt"),
        None,
        Some(&user.cookie),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let fresh = body["aipt"].as_str().unwrap();
    let (status, _, _) = request(
        router,
        "POST",
        &format!("/interview/{session_id}/next-question"),
        Some(fresh),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn second_fs_exit_ends_session() {
    let test_app = app();
    let router = &test_app.router;
    let user = login(router, "alex@example.com").await;
    let (session_id, _) = create_session(router, &user).await;
    let (_, aipt, _) = precheck_and_start(router, &user, &session_id).await;
    activate(router, &aipt, &session_id).await;

    let events = chained_events(router, &user, &session_id, &["FS_EXIT"]).await;
    submit_events(router, &user, &session_id, events).await;
    let resume = chained_events(router, &user, &session_id, &["FS_READY"]).await;
    submit_events(router, &user, &session_id, resume).await;

    let again = chained_events(router, &user, &session_id, &["FS_EXIT"]).await;
    let (status, _) = submit_events(router, &user, &session_id, again).await;
    assert_eq!(status, StatusCode::OK);

    let (_, state_body, _) = request(
        router,
        "GET",
        &format!("/interview/{session_id}/state"),
        Some(&user.token),
        None,
        None,
    )
    .await;
    assert_eq!(state_body["state"], "Ended");
}

#[tokio::test]
async fn ended_session_summary_carries_failed_verdict() {
    let test_app = app();
    let router = &test_app.router;
    let user = login(router, "alex@example.com").await;
    let (session_id, _) = create_session(router, &user).await;
    let (_, aipt, _) = precheck_and_start(router, &user, &session_id).await;
    activate(router, &aipt, &session_id).await;

    let events = chained_events(router, &user, &session_id, &["MULTI_FACE"]).await;
    submit_events(router, &user, &session_id, events).await;

    let (status, summary, _) = request(
        router,
        "GET",
        &format!("/interview/{session_id}/summary"),
        Some(&user.token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["antiCheat"]["verdict"], "failed");
    assert_eq!(summary["antiCheat"]["strikes"].as_array().unwrap().len(), 1);
}
