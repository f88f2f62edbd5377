//! State-transition executor.
//!
//! [`Lifecycle`] is the only type in the workspace that changes a session's
//! `state`. It validates the transition against the table in
//! [`crate::session::next_state`], applies it with the store's optimistic
//! guard, bumps the token-generation counter when the session leaves
//! `Active` (invalidating outstanding AIPT/UPT tokens), and fans out the
//! corresponding stream event.
//!
//! `PendingPrecheck -> Ready` and `Ready -> Active` carry no stream event of
//! their own; clients observe them through endpoint responses. Every other
//! transition produces a `SESSION_*` frame, and terminal frames close all
//! subscribers.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::fanout::{EventBus, SessionEvent};
use crate::session::{SessionState, TransitionCause, TransitionError, next_state};
use crate::store::{SessionStore, StoreError};

/// Lifecycle failures.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The transition is not in the table.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Storage failure (including a lost optimistic race).
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Executes state transitions with their side effects.
pub struct Lifecycle {
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
}

impl Lifecycle {
    /// Creates a lifecycle executor.
    #[must_use]
    pub fn new(store: Arc<SessionStore>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Applies `cause` to the session's current state and returns the new
    /// state.
    ///
    /// Callers serialize per session; the store's optimistic guard turns any
    /// remaining race into [`StoreError::StateMoved`] instead of a silent
    /// overwrite.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Transition`] if the table rejects the pair;
    /// [`LifecycleError::Store`] on persistence failure.
    pub fn transition(
        &self,
        session_id: &str,
        cause: TransitionCause,
    ) -> Result<SessionState, LifecycleError> {
        let session = self.store.get_session(session_id)?;
        let from = session.state;
        let to = next_state(from, cause)?;
        let leaving_active = from == SessionState::Active && to != SessionState::Active;

        self.store
            .set_state(session_id, from, to, Some(cause.as_str()), leaving_active)?;

        info!(
            session_id = %session_id,
            from = %from,
            to = %to,
            cause = cause.as_str(),
            "session transition"
        );

        match to {
            SessionState::Paused => {
                self.bus.publish(
                    session_id,
                    SessionEvent::SessionPaused {
                        cause: cause.as_str().to_string(),
                    },
                );
            }
            SessionState::Active if from == SessionState::Paused => {
                self.bus.publish(session_id, SessionEvent::SessionResumed {});
            }
            SessionState::Ended => {
                self.bus.publish(
                    session_id,
                    SessionEvent::SessionEnded {
                        cause: cause.as_str().to_string(),
                    },
                );
            }
            SessionState::Completed => {
                self.bus
                    .publish(session_id, SessionEvent::SessionCompleted {});
            }
            _ => {}
        }

        Ok(to)
    }

    /// The store this lifecycle writes through.
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The bus this lifecycle publishes to.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
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

    fn setup() -> (Arc<SessionStore>, Arc<EventBus>, Lifecycle, String) {
        let store = Arc::new(SessionStore::in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let lifecycle = Lifecycle::new(Arc::clone(&store), Arc::clone(&bus));
        let id = store.create_session("u", &config()).unwrap().id;
        (store, bus, lifecycle, id)
    }

    #[tokio::test]
    async fn test_pause_bumps_generation_and_fans_out() {
        let (store, bus, lifecycle, id) = setup();
        lifecycle
            .transition(&id, TransitionCause::PrecheckPassed)
            .unwrap();
        lifecycle
            .transition(&id, TransitionCause::InterviewStarted)
            .unwrap();
        let (_, mut rx) = bus.subscribe(&id, None);

        let state = lifecycle
            .transition(&id, TransitionCause::PolicyPause)
            .unwrap();
        assert_eq!(state, SessionState::Paused);
        assert_eq!(store.get_session(&id).unwrap().token_generation, 1);
        assert!(matches!(
            rx.recv().await.unwrap().event,
            SessionEvent::SessionPaused { .. }
        ));
    }

    #[tokio::test]
    async fn test_resume_does_not_bump_generation() {
        let (store, _bus, lifecycle, id) = setup();
        lifecycle
            .transition(&id, TransitionCause::PrecheckPassed)
            .unwrap();
        lifecycle
            .transition(&id, TransitionCause::InterviewStarted)
            .unwrap();
        lifecycle
            .transition(&id, TransitionCause::PolicyPause)
            .unwrap();
        lifecycle
            .transition(&id, TransitionCause::ChecksResatisfied)
            .unwrap();
        assert_eq!(store.get_session(&id).unwrap().token_generation, 1);
        assert_eq!(
            store.get_session(&id).unwrap().state,
            SessionState::Active
        );
    }

    #[tokio::test]
    async fn test_terminal_transition_closes_streams() {
        let (_store, bus, lifecycle, id) = setup();
        lifecycle
            .transition(&id, TransitionCause::PrecheckPassed)
            .unwrap();
        lifecycle
            .transition(&id, TransitionCause::InterviewStarted)
            .unwrap();
        let (_, mut rx) = bus.subscribe(&id, None);
        lifecycle
            .transition(&id, TransitionCause::PolicyBreach)
            .unwrap();
        assert!(matches!(
            rx.recv().await.unwrap().event,
            SessionEvent::SessionEnded { .. }
        ));
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(&id), 0);
    }

    #[tokio::test]
    async fn test_transition_from_terminal_rejected() {
        let (_store, _bus, lifecycle, id) = setup();
        lifecycle
            .transition(&id, TransitionCause::PrecheckPassed)
            .unwrap();
        lifecycle
            .transition(&id, TransitionCause::InterviewStarted)
            .unwrap();
        lifecycle
            .transition(&id, TransitionCause::Finalized)
            .unwrap();
        let err = lifecycle
            .transition(&id, TransitionCause::PolicyPause)
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Transition(TransitionError::Terminal { .. })
        ));
    }
}
