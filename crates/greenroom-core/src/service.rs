//! Session orchestration.
//!
//! [`SessionService`] ties the store, lifecycle, anti-cheat engine, AI
//! proxy, and fan-out bus together and owns the per-session write lock. The
//! locking discipline:
//!
//! - every write path for a session runs under that session's async mutex;
//! - provider calls (question generation, summarization, feedback) run
//!   *outside* the lock — a slow provider must never hold up strike
//!   ingestion — and their results are committed under the lock after
//!   re-checking state;
//! - the re-check is what makes the finalize-vs-strike race deterministic: a
//!   major strike that lands first moves the session to `Ended`, and the
//!   late finalize observes the terminal state and fails with
//!   `invalid_state` instead of completing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::ai::{AiError, AiProxy, fallback};
use crate::anticheat::{AntiCheatEngine, AntiCheatError, IngestOutcome};
use crate::chain::{AntiCheatEvent, ChainError, Tail};
use crate::codeeval::{CodeEvalError, CodeEvaluator, CodeTest, TestResult};
use crate::fanout::{EventBus, SessionEvent};
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::session::{
    ConfigValidationError, Session, SessionConfig, SessionState, TransitionCause, TransitionError,
};
use crate::store::{Question, SessionStore, StoreError};

/// Service failures; the gateway maps these onto the wire error taxonomy.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Schema or range violation (`validation_failed`).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown record (`not_found`).
    #[error("{kind} not found")]
    NotFound {
        /// Record kind.
        kind: &'static str,
    },

    /// Operation not allowed in the current state (`invalid_state`).
    #[error("operation not allowed in state {state}")]
    InvalidState {
        /// Current state.
        state: SessionState,
    },

    /// Duplicate answer (`already_exists`).
    #[error("answer already exists for question")]
    AlreadyExists,

    /// Anti-cheat chain rejection (`chain_broken`); carries the stored tail.
    #[error("anti-cheat chain broken")]
    ChainBroken {
        /// Stored tail for client re-sync.
        tail: Tail,
    },

    /// Per-session concurrency guard hit (`rate_limited`).
    #[error("request already in flight for session")]
    RateLimited,

    /// Unexpected failure (`internal`).
    #[error("internal error")]
    Internal(#[source] StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, .. } => Self::NotFound { kind },
            StoreError::InvalidState { state } => Self::InvalidState { state },
            StoreError::AnswerExists { .. } => Self::AlreadyExists,
            StoreError::NoSlotsRemaining { .. } => {
                Self::Validation("no question slots remaining".into())
            }
            other => Self::Internal(other),
        }
    }
}

impl From<LifecycleError> for ServiceError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Transition(TransitionError::Terminal { state })
            | LifecycleError::Transition(TransitionError::NotAllowed { from: state, .. }) => {
                Self::InvalidState { state }
            }
            LifecycleError::Store(err) => err.into(),
        }
    }
}

impl From<AntiCheatError> for ServiceError {
    fn from(err: AntiCheatError) -> Self {
        match err {
            AntiCheatError::Chain(ChainError::Broken {
                tail_seq, tail_hash, ..
            }) => Self::ChainBroken {
                tail: Tail {
                    seq: tail_seq,
                    hash: tail_hash,
                },
            },
            AntiCheatError::Chain(other) => Self::Validation(other.to_string()),
            AntiCheatError::Terminal { state } => Self::InvalidState { state },
            AntiCheatError::Store(err) => err.into(),
        }
    }
}

impl From<ConfigValidationError> for ServiceError {
    fn from(err: ConfigValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Outcome of a pre-check submission.
#[derive(Debug, Clone)]
pub struct PrecheckOutcome {
    /// Opaque id for this submission.
    pub precheck_id: String,
    /// `pass` | `warning` | `fail`, from the latest submission's checks.
    pub overall_status: &'static str,
    /// Whether the session may proceed to start.
    pub can_proceed: bool,
    /// Chain tail after any submitted events were ingested.
    pub tail: Tail,
}

/// Outcome of an answer submission.
#[derive(Debug, Clone)]
pub struct AnswerOutcome {
    /// The persisted answer id.
    pub answer_id: String,
    /// Immediate feedback, when analysis succeeded.
    pub immediate_feedback: Option<Value>,
}

/// Per-session async mutexes, created on demand.
#[derive(Default)]
struct SessionLocks {
    map: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    fn handle(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            map.entry(session_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

/// The orchestration layer. One instance per process.
pub struct SessionService {
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    lifecycle: Arc<Lifecycle>,
    engine: AntiCheatEngine,
    proxy: AiProxy,
    evaluator: CodeEvaluator,
    locks: SessionLocks,
}

impl SessionService {
    /// Wires the service together.
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        proxy: AiProxy,
        evaluator: CodeEvaluator,
    ) -> Self {
        let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&store), Arc::clone(&bus)));
        let engine = AntiCheatEngine::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&lifecycle),
        );
        Self {
            store,
            bus,
            lifecycle,
            engine,
            proxy,
            evaluator,
            locks: SessionLocks::default(),
        }
    }

    /// The underlying store (read paths and tests).
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The fan-out bus (the duplex gateway subscribes through this).
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Creates a session in `PendingPrecheck`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Validation`] on config violations.
    pub fn create_session(
        &self,
        user_id: &str,
        config: &SessionConfig,
    ) -> Result<Session, ServiceError> {
        config.validate()?;
        let session = self.store.create_session(user_id, config)?;
        info!(session_id = %session.id, user_id = %user_id, "session created");
        Ok(session)
    }

    /// Loads a session, hiding other users' sessions as `not_found`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`].
    pub fn get_owned_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Session, ServiceError> {
        let session = self.store.get_session(session_id)?;
        if session.user_id != user_id {
            return Err(ServiceError::NotFound { kind: "session" });
        }
        Ok(session)
    }

    /// Loads a session without an ownership check (token-bound paths; the
    /// token's session binding was already enforced).
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`].
    pub fn get_session(&self, session_id: &str) -> Result<Session, ServiceError> {
        Ok(self.store.get_session(session_id)?)
    }

    /// Lists a user's session ids, newest first.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Internal`] on storage failure.
    pub fn list_sessions(&self, user_id: &str) -> Result<Vec<String>, ServiceError> {
        Ok(self.store.list_sessions_for_user(user_id)?)
    }

    /// Submits an environment pre-check: events first (through the engine,
    /// extending the chain), then check evaluation.
    ///
    /// Repeated submissions are additive for events; `can_proceed` reflects
    /// only this submission's checks. A passing pre-check moves
    /// `PendingPrecheck -> Ready`; on a paused session it re-satisfies the
    /// checks and resumes.
    ///
    /// # Errors
    ///
    /// [`ServiceError::ChainBroken`] with the stored tail on chain mismatch;
    /// [`ServiceError::InvalidState`] on terminal sessions.
    pub async fn submit_precheck(
        &self,
        session_id: &str,
        checks: &Value,
        events: &[AntiCheatEvent],
    ) -> Result<PrecheckOutcome, ServiceError> {
        let guard = self.locks.handle(session_id);
        let _lock = guard.lock().await;

        let session = self.store.get_session(session_id)?;
        if session.state.is_terminal() {
            return Err(ServiceError::InvalidState {
                state: session.state,
            });
        }

        let tail = if events.is_empty() {
            session.tail.clone()
        } else {
            self.engine.ingest_batch(session_id, events).await?.tail
        };

        let overall_status = evaluate_checks(checks);
        let can_proceed = overall_status != "fail";
        self.store.set_precheck_passed(session_id, can_proceed)?;

        if can_proceed {
            let state = self.store.get_session(session_id)?.state;
            match state {
                SessionState::PendingPrecheck => {
                    self.lifecycle
                        .transition(session_id, TransitionCause::PrecheckPassed)?;
                }
                SessionState::Paused => {
                    self.engine.clear_countdown(session_id);
                    self.lifecycle
                        .transition(session_id, TransitionCause::ChecksResatisfied)?;
                }
                _ => {}
            }
        }

        Ok(PrecheckOutcome {
            precheck_id: uuid::Uuid::new_v4().to_string(),
            overall_status,
            can_proceed,
            tail,
        })
    }

    /// Validates that a session is `Ready` for `/start`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidState`] otherwise, or
    /// [`ServiceError::Validation`] when the pre-check never passed.
    pub fn ensure_ready(&self, session_id: &str) -> Result<Session, ServiceError> {
        let session = self.store.get_session(session_id)?;
        if session.state != SessionState::Ready {
            return Err(ServiceError::InvalidState {
                state: session.state,
            });
        }
        if !session.precheck_passed {
            return Err(ServiceError::Validation("pre-check has not passed".into()));
        }
        Ok(session)
    }

    /// Generates, persists, and fans out the next question. The first call
    /// on a `Ready` session performs the `Ready -> Active` transition.
    ///
    /// # Errors
    ///
    /// [`ServiceError::RateLimited`] when a question request is already in
    /// flight; [`ServiceError::InvalidState`] outside `Ready`/`Active`;
    /// [`ServiceError::Validation`] when every slot is used.
    pub async fn next_question(
        &self,
        session_id: &str,
    ) -> Result<(Question, u32), ServiceError> {
        let session = self.store.get_session(session_id)?;
        if !matches!(session.state, SessionState::Ready | SessionState::Active) {
            return Err(ServiceError::InvalidState {
                state: session.state,
            });
        }
        let total = session.config.question_count;
        if session.asked_count >= total {
            return Err(ServiceError::Validation("no question slots remaining".into()));
        }

        // Provider call runs outside the session lock; the in-flight claim
        // inside the proxy is what rejects a racing second request.
        let asked = self.store.list_questions(session_id)?;
        let draft = self
            .proxy
            .next_question(&session, &asked)
            .await
            .map_err(|AiError::InFlight| ServiceError::RateLimited)?;

        let guard = self.locks.handle(session_id);
        let _lock = guard.lock().await;

        let session = self.store.get_session(session_id)?;
        match session.state {
            SessionState::Ready => {
                self.lifecycle
                    .transition(session_id, TransitionCause::InterviewStarted)?;
            }
            SessionState::Active => {}
            state => return Err(ServiceError::InvalidState { state }),
        }

        let question = self.store.append_question(session_id, &draft)?;
        self.bus.publish(
            session_id,
            SessionEvent::QuestionCreated {
                question_id: question.id.clone(),
                question_number: question.ordinal,
                question_type: question.question_type.clone(),
            },
        );
        Ok((question, total))
    }

    /// Persists an answer, fans out `ANSWER_RECORDED`, then attaches
    /// immediate feedback (best effort, outside the lock).
    ///
    /// # Errors
    ///
    /// [`ServiceError::AlreadyExists`] for a duplicate;
    /// [`ServiceError::NotFound`] for an unknown question;
    /// [`ServiceError::InvalidState`] outside `Active`.
    pub async fn submit_answer(
        &self,
        session_id: &str,
        question_id: &str,
        kind: &str,
        payload: &Value,
        time_spent: Option<u32>,
    ) -> Result<AnswerOutcome, ServiceError> {
        let answer = {
            let guard = self.locks.handle(session_id);
            let _lock = guard.lock().await;
            let answer =
                self.store
                    .append_answer(session_id, question_id, kind, payload, time_spent)?;
            self.bus.publish(
                session_id,
                SessionEvent::AnswerRecorded {
                    question_id: question_id.to_string(),
                    answer_id: answer.id.clone(),
                },
            );
            answer
        };

        let session = self.store.get_session(session_id)?;
        let question = self.store.get_question(session_id, question_id)?;
        let feedback = self.proxy.analyze_answer(&session, &question, &answer).await;
        let immediate_feedback = match self.store.set_answer_feedback(&answer.id, &feedback) {
            Ok(()) => {
                self.bus.publish(
                    session_id,
                    SessionEvent::FeedbackCreated {
                        question_id: question_id.to_string(),
                        feedback: feedback.clone(),
                    },
                );
                Some(feedback)
            }
            Err(_) => None,
        };

        Ok(AnswerOutcome {
            answer_id: answer.id,
            immediate_feedback,
        })
    }

    /// Finalizes the session: summary generation, summary write, and the
    /// `Active -> Completed` transition.
    ///
    /// The summary is generated before the lock is taken; state is
    /// re-checked under the lock, so a major strike that ended the session
    /// mid-summarization wins and this call fails with `invalid_state`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidState`] unless the session is `Active` at
    /// commit time; [`ServiceError::RateLimited`] when a finalize is already
    /// in flight.
    pub async fn finalize(&self, session_id: &str) -> Result<(String, SessionState), ServiceError> {
        let session = self.store.get_session(session_id)?;
        if session.state != SessionState::Active {
            return Err(ServiceError::InvalidState {
                state: session.state,
            });
        }

        let questions = self.store.list_questions(session_id)?;
        let answers = self.store.list_answers(session_id)?;
        let base = self
            .proxy
            .summarize(&session, &questions, &answers)
            .await
            .map_err(|AiError::InFlight| ServiceError::RateLimited)?;

        let guard = self.locks.handle(session_id);
        let _lock = guard.lock().await;

        let session = self.store.get_session(session_id)?;
        if session.state != SessionState::Active {
            return Err(ServiceError::InvalidState {
                state: session.state,
            });
        }

        // A policy-ended session never reaches this point, so `failed` is
        // sealed elsewhere; any surviving strike downgrades pass to warning.
        let strikes = self.store.list_strikes(session_id)?;
        let verdict = if strikes.is_empty() { "pass" } else { "warning" };
        let summary = compose_summary(base, &questions, &answers, &strikes, verdict);

        let summary_id = self.store.write_summary(session_id, &summary)?;
        self.engine.clear_countdown(session_id);
        self.lifecycle
            .transition(session_id, TransitionCause::Finalized)?;
        info!(session_id = %session_id, summary_id = %summary_id, "session finalized");
        Ok((summary_id, SessionState::Completed))
    }

    /// Ingests an anti-cheat batch under the session lock.
    ///
    /// # Errors
    ///
    /// See [`AntiCheatEngine::ingest_batch`].
    pub async fn submit_anticheat(
        &self,
        session_id: &str,
        events: &[AntiCheatEvent],
    ) -> Result<IngestOutcome, ServiceError> {
        let guard = self.locks.handle(session_id);
        let _lock = guard.lock().await;
        Ok(self.engine.ingest_batch(session_id, events).await?)
    }

    /// Runs candidate code against the submitted test cases.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidState`] outside `Active`;
    /// [`ServiceError::Validation`] when the code fails the screen.
    pub async fn code_eval(
        &self,
        session_id: &str,
        code: &str,
        function_name: &str,
        tests: &[CodeTest],
    ) -> Result<Vec<TestResult>, ServiceError> {
        let session = self.store.get_session(session_id)?;
        if session.state != SessionState::Active {
            return Err(ServiceError::InvalidState {
                state: session.state,
            });
        }
        self.evaluator
            .evaluate(code, function_name, tests)
            .await
            .map_err(|err: CodeEvalError| ServiceError::Validation(err.to_string()))
    }

    /// The stored chain tail.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`].
    pub fn tail(&self, session_id: &str) -> Result<Tail, ServiceError> {
        Ok(self.store.get_session(session_id)?.tail)
    }

    /// The stored summary document.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] when none was written.
    pub fn summary(&self, session_id: &str) -> Result<(String, Value), ServiceError> {
        Ok(self.store.get_summary(session_id)?)
    }

    /// Per-question review items: question, answer (when present), and the
    /// per-question analysis from the summary.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] for an unknown session.
    pub fn review(&self, session_id: &str) -> Result<Vec<Value>, ServiceError> {
        self.store.get_session(session_id)?;
        let questions = self.store.list_questions(session_id)?;
        let answers = self.store.list_answers(session_id)?;
        let per_question: HashMap<String, Value> = self
            .store
            .get_summary(session_id)
            .map(|(_, summary)| {
                summary["perQuestion"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                item["questionId"]
                                    .as_str()
                                    .map(|id| (id.to_string(), item.clone()))
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        Ok(questions
            .iter()
            .map(|question| {
                let answer = answers.iter().find(|a| a.question_id == question.id);
                let analysis = per_question.get(&question.id);
                json!({
                    "questionId": question.id,
                    "number": question.ordinal,
                    "type": question.question_type,
                    "text": question.text,
                    "metadata": question.metadata,
                    "yourAnswer": answer.and_then(|a| a.payload.get("responseText").cloned()),
                    "answerType": answer.map(|a| a.kind.clone()),
                    "feedback": answer.and_then(|a| a.feedback.clone()),
                    "score": analysis.and_then(|p| p.get("score").cloned()),
                    "modelAnswer": analysis.and_then(|p| p.get("modelAnswer").cloned()),
                })
            })
            .collect())
    }
}

/// Rolls the per-check statuses up to `pass` | `warning` | `fail`.
///
/// Each check is an object with a `status` field; the worst status wins.
fn evaluate_checks(checks: &Value) -> &'static str {
    let mut overall = "pass";
    if let Some(map) = checks.as_object() {
        for check in map.values() {
            match check.get("status").and_then(Value::as_str) {
                Some("fail") => return "fail",
                Some("warning") => overall = "warning",
                _ => {}
            }
        }
    }
    overall
}

/// Merges the base summary with the anti-cheat verdict, the strike timeline,
/// and per-question review items.
fn compose_summary(
    mut base: Value,
    questions: &[Question],
    answers: &[crate::store::Answer],
    strikes: &[crate::policy::Strike],
    verdict: &str,
) -> Value {
    let per_question: Vec<Value> = questions
        .iter()
        .map(|question| {
            let answer = answers.iter().find(|a| a.question_id == question.id);
            let analysis = answer
                .and_then(|a| a.feedback.clone())
                .or_else(|| answer.map(|a| fallback::analyze(question, a)));
            let mut item = json!({
                "questionId": question.id,
                "number": question.ordinal,
            });
            if let Some(analysis) = analysis {
                for key in ["score", "feedback", "modelAnswer"] {
                    if let Some(value) = analysis.get(key) {
                        item[key] = value.clone();
                    }
                }
            }
            item
        })
        .collect();

    if let Some(object) = base.as_object_mut() {
        object.insert("perQuestion".to_string(), Value::Array(per_question));
        object.insert(
            "antiCheat".to_string(),
            json!({
                "verdict": verdict,
                "strikes": strikes,
            }),
        );
    }
    base
}
