//! Session model and state machine.
//!
//! A session is one candidate's interview attempt. Its configuration is
//! immutable after creation; the only fields mutated in place are `state` and
//! the counters (`asked_count`, `answered_count`, strike counters, the chain
//! tail, and the token-generation counter).
//!
//! State transitions:
//!
//! ```text
//! PendingPrecheck --(precheck passed, start requested)--> Ready
//! Ready           --(first question requested)----------> Active
//! Active          --(major strike / countdown expired)--> Paused
//! Paused          --(client re-satisfies checks)--------> Active
//! Active          --(finalize requested)----------------> Completed
//! Active          --(major policy breach / user exit)---> Ended
//! Paused          --(resume timeout exceeded)-----------> Ended
//! ```
//!
//! [`next_state`] is the single transition table; everything that mutates
//! `state` goes through [`crate::lifecycle::Lifecycle`], which calls it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Tail;

/// Bounds on the configured question count.
pub const QUESTION_COUNT_RANGE: std::ops::RangeInclusive<u32> = 5..=20;

/// Bounds on the configured duration limit, minutes.
pub const DURATION_LIMIT_RANGE: std::ops::RangeInclusive<u32> = 15..=90;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created; waiting for the environment pre-check.
    PendingPrecheck,
    /// Pre-check passed; waiting for start.
    Ready,
    /// Interview in progress.
    Active,
    /// Suspended by a strike or countdown; may resume.
    Paused,
    /// Finalized normally. Terminal.
    Completed,
    /// Ended by policy breach, user exit, or resume timeout. Terminal.
    Ended,
}

impl SessionState {
    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingPrecheck => "PendingPrecheck",
            Self::Ready => "Ready",
            Self::Active => "Active",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Ended => "Ended",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PendingPrecheck" => Some(Self::PendingPrecheck),
            "Ready" => Some(Self::Ready),
            "Active" => Some(Self::Active),
            "Paused" => Some(Self::Paused),
            "Completed" => Some(Self::Completed),
            "Ended" => Some(Self::Ended),
            _ => None,
        }
    }

    /// Whether the state accepts no further writes.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Ended)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended or paused; recorded and fanned out with the
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Environment pre-check accepted.
    PrecheckPassed,
    /// First next-question request arrived.
    InterviewStarted,
    /// A strike rule fired an auto-pause.
    PolicyPause,
    /// A rescinding event arrived inside the countdown window.
    ChecksResatisfied,
    /// Candidate finalized the interview.
    Finalized,
    /// A strike rule fired an auto-end.
    PolicyBreach,
    /// Candidate abandoned the session.
    UserExit,
    /// The pause countdown elapsed without rescission.
    ResumeTimeout,
}

impl TransitionCause {
    /// Wire name of the cause.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PrecheckPassed => "precheck_passed",
            Self::InterviewStarted => "interview_started",
            Self::PolicyPause => "policy_pause",
            Self::ChecksResatisfied => "checks_resatisfied",
            Self::Finalized => "finalized",
            Self::PolicyBreach => "policy_breach",
            Self::UserExit => "user_exit",
            Self::ResumeTimeout => "resume_timeout",
        }
    }
}

/// Transition rejections.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// No rule allows this transition from the current state.
    #[error("no transition from {from} for {cause:?}")]
    NotAllowed {
        /// State the session is in.
        from: SessionState,
        /// Requested cause.
        cause: TransitionCause,
    },

    /// The session is terminal; nothing further is accepted.
    #[error("session is terminal in state {state}")]
    Terminal {
        /// The terminal state.
        state: SessionState,
    },
}

/// The transition table. Pure; does not touch storage.
///
/// # Errors
///
/// [`TransitionError::Terminal`] from `Completed`/`Ended`;
/// [`TransitionError::NotAllowed`] for any pair outside the table.
pub fn next_state(
    from: SessionState,
    cause: TransitionCause,
) -> Result<SessionState, TransitionError> {
    use SessionState as S;
    use TransitionCause as C;

    if from.is_terminal() {
        return Err(TransitionError::Terminal { state: from });
    }

    match (from, cause) {
        (S::PendingPrecheck, C::PrecheckPassed) => Ok(S::Ready),
        (S::Ready, C::InterviewStarted) => Ok(S::Active),
        (S::Active, C::PolicyPause) => Ok(S::Paused),
        (S::Paused, C::ChecksResatisfied) => Ok(S::Active),
        (S::Active, C::Finalized) => Ok(S::Completed),
        (S::Active, C::PolicyBreach | C::UserExit) => Ok(S::Ended),
        (S::Paused, C::PolicyBreach | C::ResumeTimeout) => Ok(S::Ended),
        _ => Err(TransitionError::NotAllowed { from, cause }),
    }
}

/// Immutable session configuration, fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Role the candidate is interviewing for, e.g. `"QA"`.
    pub role_category: String,
    /// Optional finer-grained role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_sub_type: Option<String>,
    /// Years of experience.
    pub experience_years: u32,
    /// Months of experience beyond the years.
    pub experience_months: u32,
    /// Selected question modes, subset of
    /// {`behavioral`, `coding`, `scenario`, `mcq`, `fib`, `random`}.
    pub modes: Vec<String>,
    /// Number of questions, 5..=20.
    pub question_count: u32,
    /// Duration limit in minutes, 15..=90.
    pub duration_limit: u32,
    /// Interview language tag, e.g. `"en-us"`.
    pub language: String,
    /// Optional accent preference for voice synthesis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accent_preference: Option<String>,
    /// Difficulty: `easy` | `medium` | `hard` | `adaptive`.
    pub difficulty: String,
    /// Optional pasted job description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_description: Option<String>,
    /// Optional opaque resume reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_file_ref: Option<String>,
    /// Companies the candidate targets.
    #[serde(default)]
    pub company_targets: Vec<String>,
    /// Whether curated question sources may be used.
    #[serde(default = "default_true")]
    pub include_curated_questions: bool,
    /// Whether AI-generated questions are allowed.
    #[serde(default = "default_true")]
    pub allow_ai_generated: bool,
    /// Whether multiple-choice questions are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_mcq: Option<bool>,
    /// Whether fill-in-the-blank questions are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_fib: Option<bool>,
    /// Consent to recording. Must be true.
    pub consent_recording: bool,
    /// Consent to anti-cheat monitoring. Must be true.
    pub consent_anti_cheat: bool,
    /// When consent was given, ISO-8601 UTC.
    pub consent_timestamp: String,
}

fn default_true() -> bool {
    true
}

/// Configuration validation failures, surfaced as `validation_failed`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// A consent flag is false.
    #[error("both consent flags are required")]
    ConsentRequired,

    /// `question_count` is outside 5..=20.
    #[error("question count {0} outside 5..=20")]
    QuestionCountOutOfRange(u32),

    /// `duration_limit` is outside 15..=90.
    #[error("duration limit {0} outside 15..=90 minutes")]
    DurationOutOfRange(u32),

    /// No mode was selected.
    #[error("at least one mode is required")]
    NoModes,

    /// An unknown mode name was submitted.
    #[error("unknown mode {0:?}")]
    UnknownMode(String),

    /// An unknown difficulty name was submitted.
    #[error("unknown difficulty {0:?}")]
    UnknownDifficulty(String),
}

impl SessionConfig {
    /// Validates ranges, modes, difficulty, and consent.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !self.consent_recording || !self.consent_anti_cheat {
            return Err(ConfigValidationError::ConsentRequired);
        }
        if !QUESTION_COUNT_RANGE.contains(&self.question_count) {
            return Err(ConfigValidationError::QuestionCountOutOfRange(
                self.question_count,
            ));
        }
        if !DURATION_LIMIT_RANGE.contains(&self.duration_limit) {
            return Err(ConfigValidationError::DurationOutOfRange(
                self.duration_limit,
            ));
        }
        if self.modes.is_empty() {
            return Err(ConfigValidationError::NoModes);
        }
        for mode in &self.modes {
            if !matches!(
                mode.as_str(),
                "behavioral" | "coding" | "scenario" | "mcq" | "fib" | "random"
            ) {
                return Err(ConfigValidationError::UnknownMode(mode.clone()));
            }
        }
        if !matches!(
            self.difficulty.as_str(),
            "easy" | "medium" | "hard" | "adaptive"
        ) {
            return Err(ConfigValidationError::UnknownDifficulty(
                self.difficulty.clone(),
            ));
        }
        Ok(())
    }
}

/// A persisted session record.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque, unguessable id.
    pub id: String,
    /// Owning candidate.
    pub user_id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Immutable configuration.
    pub config: SessionConfig,
    /// Questions asked so far.
    pub asked_count: u32,
    /// Answers recorded so far. Always `<= asked_count`.
    pub answered_count: u32,
    /// Minor strikes so far.
    pub strike_minor_count: u32,
    /// Major strikes so far.
    pub strike_major_count: u32,
    /// Anti-cheat chain tail.
    pub tail: Tail,
    /// Token-generation counter; bumped when leaving `Active`, re-checked for
    /// AIPT/UPT on use.
    pub token_generation: u64,
    /// Whether the latest pre-check submission passed.
    pub precheck_passed: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the interview became `Active`, if it did.
    pub started_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state, if it did.
    pub sealed_at: Option<DateTime<Utc>>,
    /// Recorded cause for the terminal transition, if any.
    pub end_cause: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            role_category: "QA".into(),
            role_sub_type: None,
            experience_years: 5,
            experience_months: 0,
            modes: vec!["behavioral".into()],
            question_count: 5,
            duration_limit: 30,
            language: "en-us".into(),
            accent_preference: None,
            difficulty: "adaptive".into(),
            job_description: None,
            resume_file_ref: None,
            company_targets: vec![],
            include_curated_questions: true,
            allow_ai_generated: true,
            enable_mcq: None,
            enable_fib: None,
            consent_recording: true,
            consent_anti_cheat: true,
            consent_timestamp: "2025-11-02T12:00:00Z".into(),
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        use SessionState as S;
        use TransitionCause as C;
        let s = next_state(S::PendingPrecheck, C::PrecheckPassed).unwrap();
        assert_eq!(s, S::Ready);
        let s = next_state(s, C::InterviewStarted).unwrap();
        assert_eq!(s, S::Active);
        let s = next_state(s, C::Finalized).unwrap();
        assert_eq!(s, S::Completed);
    }

    #[test]
    fn test_pause_resume_and_timeout() {
        use SessionState as S;
        use TransitionCause as C;
        assert_eq!(next_state(S::Active, C::PolicyPause).unwrap(), S::Paused);
        assert_eq!(
            next_state(S::Paused, C::ChecksResatisfied).unwrap(),
            S::Active
        );
        assert_eq!(next_state(S::Paused, C::ResumeTimeout).unwrap(), S::Ended);
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        use SessionState as S;
        use TransitionCause as C;
        for cause in [C::PrecheckPassed, C::Finalized, C::PolicyBreach] {
            assert_eq!(
                next_state(S::Completed, cause).unwrap_err(),
                TransitionError::Terminal {
                    state: S::Completed
                }
            );
            assert_eq!(
                next_state(S::Ended, cause).unwrap_err(),
                TransitionError::Terminal { state: S::Ended }
            );
        }
    }

    #[test]
    fn test_out_of_order_transitions_rejected() {
        use SessionState as S;
        use TransitionCause as C;
        assert!(next_state(S::PendingPrecheck, C::Finalized).is_err());
        assert!(next_state(S::Ready, C::PolicyPause).is_err());
        assert!(next_state(S::Paused, C::Finalized).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let mut c = config();
        c.consent_anti_cheat = false;
        assert_eq!(
            c.validate().unwrap_err(),
            ConfigValidationError::ConsentRequired
        );

        let mut c = config();
        c.question_count = 2;
        assert_eq!(
            c.validate().unwrap_err(),
            ConfigValidationError::QuestionCountOutOfRange(2)
        );

        let mut c = config();
        c.modes = vec!["interpretive-dance".into()];
        assert!(matches!(
            c.validate().unwrap_err(),
            ConfigValidationError::UnknownMode(_)
        ));

        let mut c = config();
        c.difficulty = "brutal".into();
        assert!(matches!(
            c.validate().unwrap_err(),
            ConfigValidationError::UnknownDifficulty(_)
        ));
    }
}
