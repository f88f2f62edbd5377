//! Anti-cheat engine.
//!
//! Ingests event batches submitted under an ACET: verifies chain integrity
//! ([`crate::chain`]), persists accepted batches atomically, then walks the
//! strike policy once per event. Strikes are persisted and fanned out as
//! `STRIKE_CREATED`; auto-pause and auto-end are requested from the
//! [`Lifecycle`] — the engine never mutates state directly.
//!
//! # Countdown
//!
//! An auto-pause starts a 10 s countdown. If the violating condition is not
//! rescinded by the type-specific event (e.g. `FS_READY` cancels an
//! `FS_EXIT` pause) before the timer fires, the pause escalates to auto-end.
//! The countdown fires at most once: starting a new countdown, rescission,
//! and escalation all remove the registered handle, and the timer task
//! aborts if its handle is already gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::ai::fallback;
use crate::chain::{self, AntiCheatEvent, ChainError, Tail};
use crate::fanout::{EventBus, SessionEvent};
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::policy::{
    FACE_MISSING_GRACE_SECS, MINOR_PAUSE_THRESHOLD, PAUSE_COUNTDOWN_SECS, Strike, StrikeAction,
    StrikeSeverity, rule_for,
};
use crate::session::{SessionState, TransitionCause};
use crate::store::{SessionStore, StoreError};

/// Engine failures.
#[derive(Debug, Error)]
pub enum AntiCheatError {
    /// The batch failed the chain check; carries the stored tail so the
    /// client can re-sync.
    #[error("chain broken: {0}")]
    Chain(ChainError),

    /// The session is terminal.
    #[error("session is terminal in state {state}")]
    Terminal {
        /// The terminal state.
        state: SessionState,
    },

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What an accepted batch did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// The new chain tail.
    pub tail: Tail,
    /// State after policy evaluation.
    pub state: SessionState,
    /// Strikes recorded for this batch.
    pub strike_count: usize,
}

struct CountdownHandle {
    // Dropping the sender cancels the timer task.
    _cancel: oneshot::Sender<()>,
    rescinded_by: Option<&'static str>,
}

/// The engine. Cheap to share; all state lives behind `Arc`s.
pub struct AntiCheatEngine {
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    lifecycle: Arc<Lifecycle>,
    countdowns: Arc<Mutex<HashMap<String, CountdownHandle>>>,
    countdown: Duration,
}

impl AntiCheatEngine {
    /// Creates an engine with the default 10 s countdown.
    #[must_use]
    pub fn new(store: Arc<SessionStore>, bus: Arc<EventBus>, lifecycle: Arc<Lifecycle>) -> Self {
        Self::with_countdown(store, bus, lifecycle, Duration::from_secs(PAUSE_COUNTDOWN_SECS))
    }

    /// Creates an engine with a custom countdown (tests).
    #[must_use]
    pub fn with_countdown(
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        lifecycle: Arc<Lifecycle>,
        countdown: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            lifecycle,
            countdowns: Arc::new(Mutex::new(HashMap::new())),
            countdown,
        }
    }

    /// Ingests one batch for a session.
    ///
    /// Callers hold the per-session write lock. On success the whole batch is
    /// durable, the tail has advanced, policy has been applied, and any
    /// resulting transition (with its fan-out) has happened.
    ///
    /// # Errors
    ///
    /// [`AntiCheatError::Terminal`] if the session is `Completed`/`Ended`;
    /// [`AntiCheatError::Chain`] if the batch does not extend the stored
    /// tail.
    pub async fn ingest_batch(
        &self,
        session_id: &str,
        events: &[AntiCheatEvent],
    ) -> Result<IngestOutcome, AntiCheatError> {
        let session = self.store.get_session(session_id)?;
        if session.state.is_terminal() {
            return Err(AntiCheatError::Terminal {
                state: session.state,
            });
        }

        let (linked, new_tail) = chain::verify_batch(session_id, &session.tail, events)
            .map_err(AntiCheatError::Chain)?;
        self.store
            .append_anticheat_batch(session_id, &session.tail, &linked, &new_tail)?;

        // Rescission first: a batch like [FS_READY] must resume the session
        // before strike evaluation looks at anything else it carries.
        let mut state = session.state;
        if state == SessionState::Paused && self.rescinds(session_id, events) {
            self.clear_countdown(session_id);
            match self
                .lifecycle
                .transition(session_id, TransitionCause::ChecksResatisfied)
            {
                Ok(next) => state = next,
                Err(err) => warn!(session_id = %session_id, error = %err, "resume failed"),
            }
        }

        let strikes = self.evaluate(state, &session, events)?;
        let strike_count = strikes.len();
        self.store.record_strikes(&strikes)?;
        for strike in &strikes {
            self.bus.publish(
                session_id,
                SessionEvent::StrikeCreated {
                    severity: strike.severity.as_str().to_string(),
                    event_type: strike.event_type.clone(),
                    seq: strike.seq,
                    action: strike.action.as_str().to_string(),
                },
            );
        }

        state = self.apply_actions(session_id, state, &strikes).await?;

        Ok(IngestOutcome {
            tail: new_tail,
            state,
            strike_count,
        })
    }

    /// Cancels any pending countdown (used when a session finalizes or ends
    /// through another path).
    pub fn clear_countdown(&self, session_id: &str) {
        self.countdowns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(session_id);
    }

    fn rescinds(&self, session_id: &str, events: &[AntiCheatEvent]) -> bool {
        let countdowns = self
            .countdowns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(handle) = countdowns.get(session_id) else {
            return false;
        };
        let Some(rescind_type) = handle.rescinded_by else {
            return false;
        };
        events.iter().any(|e| e.event_type == rescind_type)
    }

    /// Walks the policy table over the batch and decides each strike's
    /// action. Counters include strikes recorded earlier in the same batch.
    fn evaluate(
        &self,
        state: SessionState,
        session: &crate::session::Session,
        events: &[AntiCheatEvent],
    ) -> Result<Vec<Strike>, AntiCheatError> {
        let session_id = session.id.as_str();
        let mut strikes = Vec::new();
        let mut minor_total = session.strike_minor_count;
        let mut batch_type_counts: HashMap<&str, u32> = HashMap::new();

        for event in events {
            let Some(rule) = rule_for(&event.event_type) else {
                continue;
            };
            if rule.event_type == "FACE_MISSING" && !face_missing_exceeds_grace(event) {
                continue;
            }

            let prior = self.store.count_strikes_for_type(session_id, rule.event_type)?
                + batch_type_counts.get(rule.event_type).copied().unwrap_or(0);
            let occurrence = prior + 1;
            *batch_type_counts.entry(rule.event_type).or_insert(0) += 1;

            let action = match rule.severity {
                StrikeSeverity::Major => {
                    if rule.end_threshold.is_some_and(|t| occurrence >= t) {
                        StrikeAction::End
                    } else {
                        rule.immediate
                    }
                }
                StrikeSeverity::Minor => {
                    minor_total += 1;
                    if minor_total >= MINOR_PAUSE_THRESHOLD {
                        StrikeAction::Pause
                    } else {
                        StrikeAction::None
                    }
                }
            };

            // A pause decision against an already-paused session records the
            // strike but takes no further action.
            let action = if action == StrikeAction::Pause && state != SessionState::Active {
                StrikeAction::None
            } else {
                action
            };

            strikes.push(Strike {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                severity: rule.severity,
                event_type: rule.event_type.to_string(),
                seq: event.seq,
                action,
                created_at: chrono::Utc::now().to_rfc3339(),
            });
        }
        Ok(strikes)
    }

    /// Executes the strongest action in the batch: end > pause > none.
    async fn apply_actions(
        &self,
        session_id: &str,
        state: SessionState,
        strikes: &[Strike],
    ) -> Result<SessionState, AntiCheatError> {
        let strongest = strikes
            .iter()
            .map(|s| s.action)
            .max_by_key(|a| match a {
                StrikeAction::None => 0,
                StrikeAction::Pause => 1,
                StrikeAction::End => 2,
            })
            .unwrap_or(StrikeAction::None);

        match strongest {
            StrikeAction::End => {
                self.clear_countdown(session_id);
                match self
                    .lifecycle
                    .transition(session_id, TransitionCause::PolicyBreach)
                {
                    Ok(next) => {
                        self.seal_summary(session_id);
                        Ok(next)
                    }
                    Err(LifecycleError::Transition(_)) => Ok(state),
                    Err(LifecycleError::Store(err)) => Err(err.into()),
                }
            }
            StrikeAction::Pause => {
                match self
                    .lifecycle
                    .transition(session_id, TransitionCause::PolicyPause)
                {
                    Ok(next) => {
                        let rescinded_by = strikes
                            .iter()
                            .filter(|s| s.action == StrikeAction::Pause)
                            .find_map(|s| rule_for(&s.event_type).and_then(|r| r.rescinded_by));
                        self.start_countdown(session_id, rescinded_by);
                        Ok(next)
                    }
                    Err(LifecycleError::Transition(_)) => Ok(state),
                    Err(LifecycleError::Store(err)) => Err(err.into()),
                }
            }
            StrikeAction::None => Ok(state),
        }
    }

    /// Registers the escalation timer. Replacing an existing handle drops its
    /// sender, which cancels the previous timer task.
    fn start_countdown(&self, session_id: &str, rescinded_by: Option<&'static str>) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut countdowns = self
                .countdowns
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            countdowns.insert(
                session_id.to_string(),
                CountdownHandle {
                    _cancel: cancel_tx,
                    rescinded_by,
                },
            );
        }

        let session_id = session_id.to_string();
        let countdown = self.countdown;
        let countdowns = Arc::clone(&self.countdowns);
        let lifecycle = Arc::clone(&self.lifecycle);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel_rx => {}
                () = tokio::time::sleep(countdown) => {
                    // Claim the handle; if it is gone, someone cancelled or
                    // replaced this countdown and the timer must not fire.
                    let claimed = countdowns
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .remove(&session_id)
                        .is_some();
                    if !claimed {
                        return;
                    }
                    info!(session_id = %session_id, "pause countdown expired");
                    match lifecycle.transition(&session_id, TransitionCause::ResumeTimeout) {
                        Ok(_) => seal_session_summary(&store, &session_id),
                        Err(err) => {
                            warn!(session_id = %session_id, error = %err, "countdown escalation skipped");
                        }
                    }
                }
            }
        });
    }

    /// Writes the failed-verdict summary for a policy-ended session.
    fn seal_summary(&self, session_id: &str) {
        seal_session_summary(&self.store, session_id);
    }
}

/// `FACE_MISSING` only strikes once the face has been gone for more than the
/// grace period; shorter blips are noise.
fn face_missing_exceeds_grace(event: &AntiCheatEvent) -> bool {
    event
        .details
        .get("duration")
        .and_then(serde_json::Value::as_f64)
        .is_some_and(|d| d > FACE_MISSING_GRACE_SECS)
}

/// Builds and persists the deterministic summary for a session that ended on
/// policy. Idempotent through the store.
fn seal_session_summary(store: &SessionStore, session_id: &str) {
    let sealed = (|| -> Result<(), StoreError> {
        let session = store.get_session(session_id)?;
        let questions = store.list_questions(session_id)?;
        let answers = store.list_answers(session_id)?;
        let strikes = store.list_strikes(session_id)?;

        let mut summary = fallback::summary(&session, &questions, &answers);
        if let Some(object) = summary.as_object_mut() {
            object.insert(
                "antiCheat".to_string(),
                serde_json::json!({
                    "verdict": "failed",
                    "strikes": strikes,
                }),
            );
        }
        store.write_summary(session_id, &summary)?;
        Ok(())
    })();
    if let Err(err) = sealed {
        warn!(session_id = %session_id, error = %err, "failed to seal summary");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;

    fn config() -> SessionConfig {
        serde_json::from_value(serde_json::json!({
            "roleCategory": "QA",
            "experienceYears": 5,
            "experienceMonths": 0,
            "modes": ["behavioral"],
            "questionCount": 5,
            "durationLimit": 30,
            "language": "en-us",
            "difficulty": "adaptive",
            "consentRecording": true,
            "consentAntiCheat": true,
            "consentTimestamp": "2025-11-02T12:00:00Z"
        }))
        .unwrap()
    }

    struct Fixture {
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        engine: AntiCheatEngine,
        session_id: String,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SessionStore::in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&store), Arc::clone(&bus)));
        let engine = AntiCheatEngine::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&lifecycle),
        );
        let session_id = store.create_session("u", &config()).unwrap().id;
        lifecycle
            .transition(&session_id, TransitionCause::PrecheckPassed)
            .unwrap();
        lifecycle
            .transition(&session_id, TransitionCause::InterviewStarted)
            .unwrap();
        Fixture {
            store,
            bus,
            engine,
            session_id,
        }
    }

    fn next_events(
        store: &SessionStore,
        session_id: &str,
        types: &[&str],
    ) -> Vec<AntiCheatEvent> {
        let tail = store.get_session(session_id).unwrap().tail;
        let mut events = Vec::new();
        let mut prev_hash = tail.hash;
        let mut seq = tail.seq;
        for event_type in types {
            seq += 1;
            let event = AntiCheatEvent {
                session_id: session_id.to_string(),
                seq,
                event_type: (*event_type).to_string(),
                details: serde_json::json!({}),
                ts: "2025-11-02T12:00:00Z".into(),
                prev_hash: prev_hash.clone(),
            };
            prev_hash = chain::event_hash(&event);
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_benign_event_no_strike() {
        let f = fixture();
        let events = next_events(&f.store, &f.session_id, &["FS_READY"]);
        let outcome = f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
        assert_eq!(outcome.strike_count, 0);
        assert_eq!(outcome.state, SessionState::Active);
        assert_eq!(outcome.tail.seq, 1);
    }

    #[tokio::test]
    async fn test_chain_break_leaves_tail_unchanged_and_no_strike() {
        let f = fixture();
        let events = next_events(&f.store, &f.session_id, &["FS_READY"]);
        f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
        let tail_before = f.store.get_session(&f.session_id).unwrap().tail;

        // Gap: seq 3 where 2 is expected.
        let mut bad = next_events(&f.store, &f.session_id, &["SCREENSHOT_ATTEMPT"]);
        bad[0].seq = 3;
        let err = f.engine.ingest_batch(&f.session_id, &bad).await.unwrap_err();
        match err {
            AntiCheatError::Chain(ChainError::Broken {
                tail_seq, tail_hash, ..
            }) => {
                assert_eq!(tail_seq, tail_before.seq);
                assert_eq!(tail_hash, tail_before.hash);
            }
            other => panic!("expected chain error, got {other:?}"),
        }
        assert_eq!(f.store.get_session(&f.session_id).unwrap().tail, tail_before);
        assert!(f.store.list_strikes(&f.session_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_screenshot_ends_on_first() {
        let f = fixture();
        let (_, mut rx) = f.bus.subscribe(&f.session_id, None);
        let events = next_events(&f.store, &f.session_id, &["SCREENSHOT_ATTEMPT"]);
        let outcome = f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
        assert_eq!(outcome.state, SessionState::Ended);
        assert_eq!(outcome.strike_count, 1);

        let strikes = f.store.list_strikes(&f.session_id).unwrap();
        assert_eq!(strikes[0].severity, StrikeSeverity::Major);
        assert_eq!(strikes[0].action, StrikeAction::End);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, SessionEvent::StrikeCreated { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.event, SessionEvent::SessionEnded { .. }));
        assert!(rx.recv().await.is_none());

        // Failed-verdict summary is sealed.
        let (_, summary) = f.store.get_summary(&f.session_id).unwrap();
        assert_eq!(summary["antiCheat"]["verdict"], "failed");
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_batches() {
        let f = fixture();
        let events = next_events(&f.store, &f.session_id, &["SCREENSHOT_ATTEMPT"]);
        f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
        let more = next_events(&f.store, &f.session_id, &["FS_READY"]);
        let err = f.engine.ingest_batch(&f.session_id, &more).await.unwrap_err();
        assert!(matches!(
            err,
            AntiCheatError::Terminal {
                state: SessionState::Ended
            }
        ));
    }

    #[tokio::test]
    async fn test_fs_exit_pauses_then_second_ends() {
        let f = fixture();
        let events = next_events(&f.store, &f.session_id, &["FS_EXIT"]);
        let outcome = f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
        assert_eq!(outcome.state, SessionState::Paused);

        // Resume, then a second FS_EXIT ends it.
        let resume = next_events(&f.store, &f.session_id, &["FS_READY"]);
        let outcome = f.engine.ingest_batch(&f.session_id, &resume).await.unwrap();
        assert_eq!(outcome.state, SessionState::Active);

        let again = next_events(&f.store, &f.session_id, &["FS_EXIT"]);
        let outcome = f.engine.ingest_batch(&f.session_id, &again).await.unwrap();
        assert_eq!(outcome.state, SessionState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_escalates_without_rescission() {
        let f = fixture();
        let events = next_events(&f.store, &f.session_id, &["FS_EXIT"]);
        f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
        assert_eq!(
            f.store.get_session(&f.session_id).unwrap().state,
            SessionState::Paused
        );

        tokio::time::sleep(Duration::from_secs(PAUSE_COUNTDOWN_SECS + 1)).await;
        let session = f.store.get_session(&f.session_id).unwrap();
        assert_eq!(session.state, SessionState::Ended);
        assert_eq!(session.end_cause.as_deref(), Some("resume_timeout"));
        assert!(f.store.get_summary(&f.session_id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fs_ready_within_window_resumes() {
        let f = fixture();
        let (_, mut rx) = f.bus.subscribe(&f.session_id, None);
        let events = next_events(&f.store, &f.session_id, &["FS_EXIT"]);
        f.engine.ingest_batch(&f.session_id, &events).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let resume = next_events(&f.store, &f.session_id, &["FS_READY"]);
        let outcome = f.engine.ingest_batch(&f.session_id, &resume).await.unwrap();
        assert_eq!(outcome.state, SessionState::Active);

        // The cancelled timer must not fire later.
        tokio::time::sleep(Duration::from_secs(PAUSE_COUNTDOWN_SECS * 2)).await;
        assert_eq!(
            f.store.get_session(&f.session_id).unwrap().state,
            SessionState::Active
        );

        // STRIKE_CREATED, SESSION_PAUSED, SESSION_RESUMED in order.
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
    async fn test_third_minor_pauses() {
        let f = fixture();
        for _ in 0..2 {
            let events = next_events(&f.store, &f.session_id, &["BLUR"]);
            let outcome = f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
            assert_eq!(outcome.state, SessionState::Active);
        }
        let events = next_events(&f.store, &f.session_id, &["BLUR"]);
        let outcome = f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
        assert_eq!(outcome.state, SessionState::Paused);
        assert_eq!(
            f.store.get_session(&f.session_id).unwrap().strike_minor_count,
            3
        );
    }

    #[tokio::test]
    async fn test_face_missing_grace() {
        let f = fixture();
        let short_blip = AntiCheatEvent {
            session_id: f.session_id.clone(),
            seq: 1,
            event_type: "FACE_MISSING".into(),
            details: serde_json::json!({"duration": 1.5}),
            ts: "2025-11-02T12:00:00Z".into(),
            prev_hash: String::new(),
        };
        let outcome = f
            .engine
            .ingest_batch(&f.session_id, &[short_blip])
            .await
            .unwrap();
        assert_eq!(outcome.strike_count, 0);

        let tail = f.store.get_session(&f.session_id).unwrap().tail;
        let long_gone = AntiCheatEvent {
            session_id: f.session_id.clone(),
            seq: tail.seq + 1,
            event_type: "FACE_MISSING".into(),
            details: serde_json::json!({"duration": 4.2}),
            ts: "2025-11-02T12:00:05Z".into(),
            prev_hash: tail.hash,
        };
        let outcome = f
            .engine
            .ingest_batch(&f.session_id, &[long_gone])
            .await
            .unwrap();
        assert_eq!(outcome.strike_count, 1);
    }

    #[tokio::test]
    async fn test_tab_switch_warns_then_ends() {
        let f = fixture();
        let events = next_events(&f.store, &f.session_id, &["TAB_SWITCH"]);
        let outcome = f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
        assert_eq!(outcome.state, SessionState::Active);
        let strikes = f.store.list_strikes(&f.session_id).unwrap();
        assert_eq!(strikes[0].action, StrikeAction::None);

        let events = next_events(&f.store, &f.session_id, &["TAB_SWITCH"]);
        let outcome = f.engine.ingest_batch(&f.session_id, &events).await.unwrap();
        assert_eq!(outcome.state, SessionState::Ended);
    }
}
