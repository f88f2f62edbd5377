//! AI proxy.
//!
//! The proxy is the sole caller of external generative-AI providers; provider
//! credentials are read from configuration and never leave this module. Three
//! operations exist: generate the next question, generate the session
//! summary, and analyze one answer for immediate feedback.
//!
//! Providers are dispatched through an enum rather than trait objects, so
//! the async provider methods stay plain `async fn`s. When no provider is
//! configured, the call fails with a non-recoverable error, or the hard
//! timeout elapses, the proxy falls back to [`fallback`] — a deterministic
//! local generator — and the rest of the system is unchanged.
//!
//! Question-type selection happens here, not in the providers: explicit
//! modes rotate in declaration order; a mode list containing `random`
//! samples from the remaining pool with a per-session seed, so the sequence
//! for a given session id is reproducible.

pub mod fallback;
mod gemini;
mod openai;

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

use crate::config::{AiProviderKind, Config};
use crate::session::Session;
use crate::store::{Answer, Question, QuestionDraft};

/// Provider call failures. Internal to the proxy; callers only ever see the
/// fallback output.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level failure.
    #[error("provider transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status.
    #[error("provider returned status {0}")]
    Status(u16),

    /// The response body did not decode into the expected shape.
    #[error("provider response malformed: {0}")]
    Decode(String),
}

/// Proxy-level failures surfaced to callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AiError {
    /// Another request of the same kind is in flight for this session.
    #[error("request of this kind already in flight for session")]
    InFlight,
}

#[derive(Debug)]
enum Backend {
    OpenAi(OpenAiProvider),
    Gemini(GeminiProvider),
    Fallback,
}

/// The AI proxy.
#[derive(Debug)]
pub struct AiProxy {
    backend: Backend,
    timeout: Duration,
    inflight: Mutex<HashSet<String>>,
}

impl AiProxy {
    /// Builds a proxy from configuration. Falls back to the deterministic
    /// generator when the selected provider has no credential.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let backend = match (config.ai_provider, &config.openai_api_key, &config.gemini_api_key) {
            (AiProviderKind::OpenAi, Some(key), _) => {
                Backend::OpenAi(OpenAiProvider::new(key.clone(), config.ai_timeout))
            }
            (AiProviderKind::Gemini, _, Some(key)) => {
                Backend::Gemini(GeminiProvider::new(key.clone(), config.ai_timeout))
            }
            _ => Backend::Fallback,
        };
        Self {
            backend,
            timeout: config.ai_timeout,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// A proxy that always uses the deterministic fallback (tests).
    #[must_use]
    pub fn fallback_only() -> Self {
        Self {
            backend: Backend::Fallback,
            timeout: Duration::from_secs(1),
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Generates the question draft for the next slot.
    ///
    /// # Errors
    ///
    /// [`AiError::InFlight`] if a next-question request for this session is
    /// already running. Provider failures are recovered via the fallback and
    /// never surface.
    pub async fn next_question(
        &self,
        session: &Session,
        asked: &[Question],
    ) -> Result<QuestionDraft, AiError> {
        let _guard = self.claim(&session.id, "question")?;
        let ordinal = asked.len() as u32 + 1;
        let question_type = select_question_type(session, ordinal);

        let provided = match &self.backend {
            Backend::Fallback => None,
            Backend::OpenAi(provider) => {
                self.recover(
                    &session.id,
                    tokio::time::timeout(
                        self.timeout,
                        provider.generate_question(session, &question_type),
                    )
                    .await,
                )
            }
            Backend::Gemini(provider) => {
                self.recover(
                    &session.id,
                    tokio::time::timeout(
                        self.timeout,
                        provider.generate_question(session, &question_type),
                    )
                    .await,
                )
            }
        };

        Ok(provided
            .unwrap_or_else(|| fallback::question(session, &question_type, ordinal)))
    }

    /// Generates the final summary.
    ///
    /// # Errors
    ///
    /// [`AiError::InFlight`] if a summary request for this session is already
    /// running. Provider failures are recovered via the fallback.
    pub async fn summarize(
        &self,
        session: &Session,
        questions: &[Question],
        answers: &[Answer],
    ) -> Result<serde_json::Value, AiError> {
        let _guard = self.claim(&session.id, "summary")?;

        let provided = match &self.backend {
            Backend::Fallback => None,
            Backend::OpenAi(provider) => self.recover(
                &session.id,
                tokio::time::timeout(
                    self.timeout,
                    provider.generate_summary(session, questions, answers),
                )
                .await,
            ),
            Backend::Gemini(provider) => self.recover(
                &session.id,
                tokio::time::timeout(
                    self.timeout,
                    provider.generate_summary(session, questions, answers),
                )
                .await,
            ),
        };

        Ok(provided.unwrap_or_else(|| fallback::summary(session, questions, answers)))
    }

    /// Analyzes one answer for immediate feedback.
    ///
    /// Feedback is best-effort: a concurrent analysis or any provider
    /// failure yields the fallback heuristic instead of an error.
    pub async fn analyze_answer(
        &self,
        session: &Session,
        question: &Question,
        answer: &Answer,
    ) -> serde_json::Value {
        let Ok(_guard) = self.claim(&session.id, "analyze") else {
            return fallback::analyze(question, answer);
        };

        let provided = match &self.backend {
            Backend::Fallback => None,
            Backend::OpenAi(provider) => self.recover(
                &session.id,
                tokio::time::timeout(self.timeout, provider.analyze_answer(question, answer)).await,
            ),
            Backend::Gemini(provider) => self.recover(
                &session.id,
                tokio::time::timeout(self.timeout, provider.analyze_answer(question, answer)).await,
            ),
        };

        provided.unwrap_or_else(|| fallback::analyze(question, answer))
    }

    /// Collapses timeout + provider errors into `None`, logging the cause.
    fn recover<T>(
        &self,
        session_id: &str,
        outcome: Result<Result<T, ProviderError>, tokio::time::error::Elapsed>,
    ) -> Option<T> {
        match outcome {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                warn!(session_id = %session_id, error = %err, "provider call failed, using fallback");
                None
            }
            Err(_) => {
                warn!(session_id = %session_id, "provider call timed out, using fallback");
                None
            }
        }
    }

    fn claim(&self, session_id: &str, kind: &str) -> Result<InFlightGuard<'_>, AiError> {
        let key = format!("{session_id}:{kind}");
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !inflight.insert(key.clone()) {
            return Err(AiError::InFlight);
        }
        Ok(InFlightGuard { proxy: self, key })
    }
}

/// Releases the per-session in-flight slot on drop.
#[derive(Debug)]
struct InFlightGuard<'a> {
    proxy: &'a AiProxy,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.proxy
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Selects the question type for a slot.
///
/// Explicit modes rotate in declaration order. A list containing `random`
/// samples from the pool of the other declared modes (or the standard pool
/// when `random` stands alone) with a hash of `(session_id, ordinal)`, so a
/// session always sees the same sequence.
#[must_use]
pub fn select_question_type(session: &Session, ordinal: u32) -> String {
    let config = &session.config;
    let explicit: Vec<&str> = config
        .modes
        .iter()
        .map(String::as_str)
        .filter(|m| *m != "random")
        .collect();

    if config.modes.iter().any(|m| m == "random") {
        let pool: Vec<&str> = if explicit.is_empty() {
            let mut pool = vec!["behavioral", "coding", "scenario"];
            if config.enable_mcq.unwrap_or(false) {
                pool.push("mcq");
            }
            if config.enable_fib.unwrap_or(false) {
                pool.push("fib");
            }
            pool
        } else {
            explicit
        };
        let index = session_seed(&session.id, ordinal) as usize % pool.len();
        return pool[index].to_string();
    }

    if explicit.is_empty() {
        return "behavioral".to_string();
    }
    explicit[(ordinal as usize - 1) % explicit.len()].to_string()
}

/// Deterministic per-session seed for slot `ordinal`.
fn session_seed(session_id: &str, ordinal: u32) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(ordinal.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().unwrap_or([0; 8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Tail;
    use crate::session::{SessionConfig, SessionState};

    fn session_with_modes(modes: &[&str]) -> Session {
        let config: SessionConfig = serde_json::from_value(serde_json::json!({
            "roleCategory": "QA",
            "experienceYears": 5,
            "experienceMonths": 0,
            "modes": modes,
            "questionCount": 8,
            "durationLimit": 30,
            "language": "en-us",
            "difficulty": "adaptive",
            "consentRecording": true,
            "consentAntiCheat": true,
            "consentTimestamp": "2025-11-02T12:00:00Z"
        }))
        .unwrap();
        Session {
            id: "session-fixed".into(),
            user_id: "u".into(),
            state: SessionState::Active,
            config,
            asked_count: 0,
            answered_count: 0,
            strike_minor_count: 0,
            strike_major_count: 0,
            tail: Tail::empty(),
            token_generation: 0,
            precheck_passed: true,
            created_at: chrono::Utc::now(),
            started_at: None,
            sealed_at: None,
            end_cause: None,
        }
    }

    #[test]
    fn test_explicit_modes_rotate_in_order() {
        let session = session_with_modes(&["behavioral", "coding", "scenario"]);
        let sequence: Vec<String> = (1..=6)
            .map(|n| select_question_type(&session, n))
            .collect();
        assert_eq!(
            sequence,
            vec![
                "behavioral",
                "coding",
                "scenario",
                "behavioral",
                "coding",
                "scenario"
            ]
        );
    }

    #[test]
    fn test_random_mode_is_reproducible() {
        let session = session_with_modes(&["random", "behavioral", "coding"]);
        let first: Vec<String> = (1..=8).map(|n| select_question_type(&session, n)).collect();
        let second: Vec<String> = (1..=8).map(|n| select_question_type(&session, n)).collect();
        assert_eq!(first, second);
        for t in &first {
            assert!(t == "behavioral" || t == "coding");
        }
    }

    #[test]
    fn test_random_alone_uses_standard_pool() {
        let session = session_with_modes(&["random"]);
        for n in 1..=8 {
            let t = select_question_type(&session, n);
            assert!(matches!(t.as_str(), "behavioral" | "coding" | "scenario"));
        }
    }

    #[tokio::test]
    async fn test_fallback_proxy_generates_without_provider() {
        let proxy = AiProxy::fallback_only();
        let session = session_with_modes(&["behavioral"]);
        let draft = proxy.next_question(&session, &[]).await.unwrap();
        assert_eq!(draft.question_type, "behavioral");
        assert!(!draft.text.is_empty());
    }

    #[tokio::test]
    async fn test_inflight_guard_released_after_call() {
        let proxy = AiProxy::fallback_only();
        let session = session_with_modes(&["behavioral"]);
        proxy.next_question(&session, &[]).await.unwrap();
        // The slot must be free again.
        proxy.next_question(&session, &[]).await.unwrap();
    }

    #[test]
    fn test_inflight_guard_blocks_second_claim() {
        let proxy = AiProxy::fallback_only();
        let guard = proxy.claim("s1", "question").unwrap();
        assert_eq!(proxy.claim("s1", "question").unwrap_err(), AiError::InFlight);
        // A different kind or session is unaffected.
        proxy.claim("s1", "summary").unwrap();
        proxy.claim("s2", "question").unwrap();
        drop(guard);
        proxy.claim("s1", "question").unwrap();
    }
}
