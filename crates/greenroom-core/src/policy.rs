//! Declarative strike policy and scoring rubric.
//!
//! Policy decisions are table lookups. The anti-cheat engine walks
//! [`STRIKE_RULES`] once per accepted event; nothing here dispatches on
//! behavior.
//!
//! Default thresholds:
//!
//! | Event type | Severity | Immediate action | Repeat threshold |
//! |------------|----------|------------------|------------------|
//! | `FACE_MISSING` > 2 s | minor | warn | pause on 3rd minor |
//! | `BLUR` | minor | warn | pause on 3rd minor |
//! | `FS_EXIT` | major | pause + 10 s countdown | end on 2nd |
//! | `TAB_SWITCH` | major | warn | end on 2nd |
//! | `SCREENSHOT_ATTEMPT` | major | pause + block | end on 1st |
//! | `MULTI_FACE` | major | pause | end on 1st |
//! | `BG_VOICE` | major | warn | end on 2nd |
//!
//! Minor strikes share one counter: the third minor (of any type) pauses the
//! session. Major thresholds are per event type.

use serde::{Deserialize, Serialize};

/// Seconds a paused session waits for rescission before auto-ending.
pub const PAUSE_COUNTDOWN_SECS: u64 = 10;

/// Total minor strikes that trigger an auto-pause.
pub const MINOR_PAUSE_THRESHOLD: u32 = 3;

/// `FACE_MISSING` below this duration produces no strike.
pub const FACE_MISSING_GRACE_SECS: f64 = 2.0;

/// Strike severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrikeSeverity {
    /// Warn-level violation.
    Minor,
    /// Policy-breach-level violation.
    Major,
}

impl StrikeSeverity {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
        }
    }
}

/// Action the engine took for a strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrikeAction {
    /// Recorded and warned only.
    None,
    /// Session auto-paused.
    Pause,
    /// Session auto-ended.
    End,
}

impl StrikeAction {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pause => "pause",
            Self::End => "end",
        }
    }
}

/// One row of the strike table.
#[derive(Debug, Clone, Copy)]
pub struct StrikeRule {
    /// Event type the rule matches.
    pub event_type: &'static str,
    /// Severity assigned to matching events.
    pub severity: StrikeSeverity,
    /// Action on a first (non-threshold) occurrence.
    pub immediate: StrikeAction,
    /// Per-type occurrence count at which the session auto-ends, if any.
    pub end_threshold: Option<u32>,
    /// Event type that rescinds this rule's pause inside the countdown
    /// window, if any.
    pub rescinded_by: Option<&'static str>,
}

/// The strike table. Order is documentation order; lookups are by type.
pub const STRIKE_RULES: &[StrikeRule] = &[
    StrikeRule {
        event_type: "FACE_MISSING",
        severity: StrikeSeverity::Minor,
        immediate: StrikeAction::None,
        end_threshold: None,
        rescinded_by: None,
    },
    StrikeRule {
        event_type: "BLUR",
        severity: StrikeSeverity::Minor,
        immediate: StrikeAction::None,
        end_threshold: None,
        rescinded_by: None,
    },
    StrikeRule {
        event_type: "FS_EXIT",
        severity: StrikeSeverity::Major,
        immediate: StrikeAction::Pause,
        end_threshold: Some(2),
        rescinded_by: Some("FS_READY"),
    },
    StrikeRule {
        event_type: "TAB_SWITCH",
        severity: StrikeSeverity::Major,
        immediate: StrikeAction::None,
        end_threshold: Some(2),
        rescinded_by: None,
    },
    StrikeRule {
        event_type: "SCREENSHOT_ATTEMPT",
        severity: StrikeSeverity::Major,
        immediate: StrikeAction::Pause,
        end_threshold: Some(1),
        rescinded_by: None,
    },
    StrikeRule {
        event_type: "MULTI_FACE",
        severity: StrikeSeverity::Major,
        immediate: StrikeAction::Pause,
        end_threshold: Some(1),
        rescinded_by: None,
    },
    StrikeRule {
        event_type: "BG_VOICE",
        severity: StrikeSeverity::Major,
        immediate: StrikeAction::None,
        end_threshold: Some(2),
        rescinded_by: None,
    },
];

/// Looks up the rule for an event type. Types without a rule (e.g.
/// `FS_READY`) never produce strikes.
#[must_use]
pub fn rule_for(event_type: &str) -> Option<&'static StrikeRule> {
    STRIKE_RULES.iter().find(|r| r.event_type == event_type)
}

/// A persisted strike record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strike {
    /// Opaque id.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Severity.
    pub severity: StrikeSeverity,
    /// Triggering event type.
    pub event_type: String,
    /// Sequence number of the triggering event.
    pub seq: u64,
    /// Action the engine took.
    pub action: StrikeAction,
    /// When the strike was recorded, ISO-8601 UTC.
    pub created_at: String,
}

/// Rubric weights used to scale sub-scores into the 0..100 overall score.
#[derive(Debug, Clone, Copy)]
pub struct RubricWeights {
    /// Weight of the communication sub-score.
    pub communication: f64,
    /// Weight of the technical sub-score.
    pub technical: f64,
    /// Weight of the problem-solving sub-score.
    pub problem_solving: f64,
}

impl Default for RubricWeights {
    fn default() -> Self {
        Self {
            communication: 0.3,
            technical: 0.4,
            problem_solving: 0.3,
        }
    }
}

impl RubricWeights {
    /// Weighted overall score from 0..100 sub-scores, clamped to 0..=100.
    #[must_use]
    pub fn overall(&self, communication: f64, technical: f64, problem_solving: f64) -> u32 {
        let total = self.communication * communication
            + self.technical * technical
            + self.problem_solving * problem_solving;
        let denom = self.communication + self.technical + self.problem_solving;
        if denom <= 0.0 {
            return 0;
        }
        (total / denom).clamp(0.0, 100.0).round() as u32
    }
}
