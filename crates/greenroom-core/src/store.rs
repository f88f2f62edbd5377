//! Persistent session store backed by `SQLite`.
//!
//! Authoritative persistence for sessions, questions, answers, anti-cheat
//! events, strikes, and summaries. Everything except the session row is
//! append-only; the session row mutates only `state` and its counters.
//!
//! # Schema
//!
//! - `sessions`: one row per session; config stored as JSON.
//! - `questions`: `(session_id, ordinal)` unique, ordinals gapless 1..N.
//! - `answers`: at most one per `question_id`.
//! - `anti_cheat_events`: `(session_id, seq)` primary key; hash column holds
//!   the event's canonical-encoding digest.
//! - `strikes`, `summaries`: derived records.
//!
//! Dependents carry `ON DELETE CASCADE` so deleting a session removes its
//! whole record tree.
//!
//! The store itself is synchronous (`Arc<Mutex<Connection>>`); cross-request
//! serialization per session is the service layer's job. State changes use an
//! optimistic `WHERE state = ?` guard so a lost race surfaces as a typed
//! error instead of a silent overwrite.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::chain::{LinkedEvent, Tail};
use crate::policy::{Strike, StrikeAction, StrikeSeverity};
use crate::session::{Session, SessionConfig, SessionState};

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Session, question, or answer id is unknown.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind, e.g. `"session"`.
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// Operation not allowed in the session's current state.
    #[error("operation not allowed in state {state}")]
    InvalidState {
        /// The state the session is in.
        state: SessionState,
    },

    /// A second answer was submitted for the same question.
    #[error("answer already exists for question {question_id}")]
    AnswerExists {
        /// The answered question.
        question_id: String,
    },

    /// All configured question slots are used.
    #[error("no question slots remaining ({asked} asked)")]
    NoSlotsRemaining {
        /// Questions already asked.
        asked: u32,
    },

    /// The stored chain tail moved since it was read.
    #[error("chain tail moved concurrently")]
    TailMoved,

    /// A state change lost its optimistic check.
    #[error("state changed concurrently, expected {expected}")]
    StateMoved {
        /// The state the caller expected.
        expected: SessionState,
    },

    /// A stored column failed to decode.
    #[error("corrupt record for {id}: {reason}")]
    Corrupt {
        /// Offending record id.
        id: String,
        /// Decode failure description.
        reason: String,
    },

    /// Underlying database failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A persisted question. Immutable.
#[derive(Debug, Clone)]
pub struct Question {
    /// Opaque id.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// 1-based, gapless ordinal.
    pub ordinal: u32,
    /// Question type, e.g. `behavioral`, `coding`.
    pub question_type: String,
    /// Question text.
    pub text: String,
    /// Generator metadata (options, fill slots, test cases).
    pub metadata: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A draft question from the AI proxy, not yet assigned an ordinal.
#[derive(Debug, Clone)]
pub struct QuestionDraft {
    /// Question type.
    pub question_type: String,
    /// Question text.
    pub text: String,
    /// Generator metadata.
    pub metadata: serde_json::Value,
}

/// A persisted answer. Immutable; at most one per question.
#[derive(Debug, Clone)]
pub struct Answer {
    /// Opaque id.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Answered question.
    pub question_id: String,
    /// Answer kind: `voice` | `text` | `code` | `mcq` | `fib`.
    pub kind: String,
    /// Full payload as submitted (text, refs, selections, transcripts).
    pub payload: serde_json::Value,
    /// Seconds the candidate spent, if reported.
    pub time_spent: Option<u32>,
    /// Immediate feedback, attached after analysis.
    pub feedback: Option<serde_json::Value>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

/// A persisted anti-cheat event row.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    /// Owning session.
    pub session_id: String,
    /// Sequence number.
    pub seq: u64,
    /// Event type.
    pub event_type: String,
    /// Details blob.
    pub details: serde_json::Value,
    /// Client timestamp.
    pub ts: String,
    /// Predecessor hash.
    pub prev_hash: String,
    /// This event's canonical-encoding hash.
    pub hash: String,
}

/// The session store.
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Opens (or creates) the database at `path` and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on open or migration failure.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store (tests).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on failure.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL,
                state            TEXT NOT NULL,
                config           TEXT NOT NULL,
                asked_count      INTEGER NOT NULL DEFAULT 0,
                answered_count   INTEGER NOT NULL DEFAULT 0,
                strike_minor     INTEGER NOT NULL DEFAULT 0,
                strike_major     INTEGER NOT NULL DEFAULT 0,
                tail_seq         INTEGER NOT NULL DEFAULT 0,
                tail_hash        TEXT NOT NULL DEFAULT '',
                token_generation INTEGER NOT NULL DEFAULT 0,
                precheck_passed  INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                started_at       TEXT,
                sealed_at        TEXT,
                end_cause        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

            CREATE TABLE IF NOT EXISTS questions (
                id         TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                ordinal    INTEGER NOT NULL,
                qtype      TEXT NOT NULL,
                text       TEXT NOT NULL,
                metadata   TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (session_id, ordinal)
            );

            CREATE TABLE IF NOT EXISTS answers (
                id          TEXT PRIMARY KEY,
                session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                question_id TEXT NOT NULL UNIQUE REFERENCES questions(id) ON DELETE CASCADE,
                kind        TEXT NOT NULL,
                payload     TEXT NOT NULL,
                time_spent  INTEGER,
                feedback    TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS anti_cheat_events (
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                seq        INTEGER NOT NULL,
                etype      TEXT NOT NULL,
                details    TEXT NOT NULL,
                ts         TEXT NOT NULL,
                prev_hash  TEXT NOT NULL,
                hash       TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );

            CREATE TABLE IF NOT EXISTS strikes (
                id         TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                severity   TEXT NOT NULL,
                etype      TEXT NOT NULL,
                seq        INTEGER NOT NULL,
                action     TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_strikes_session ON strikes(session_id);

            CREATE TABLE IF NOT EXISTS summaries (
                session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
                summary_id TEXT NOT NULL,
                summary    TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Creates a session in `PendingPrecheck` and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on write failure. Config validation is
    /// the caller's responsibility.
    pub fn create_session(
        &self,
        user_id: &str,
        config: &SessionConfig,
    ) -> Result<Session, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let config_json = serde_json::to_string(config).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        self.lock().execute(
            "INSERT INTO sessions (id, user_id, state, config, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                user_id,
                SessionState::PendingPrecheck.as_str(),
                config_json,
                now.to_rfc3339(),
            ],
        )?;
        self.get_session(&id)
    }

    /// Loads a session by id.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the id is unknown.
    pub fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, user_id, state, config, asked_count, answered_count,
                        strike_minor, strike_major, tail_seq, tail_hash,
                        token_generation, precheck_passed, created_at, started_at,
                        sealed_at, end_cause
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, u32>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, u32>(7)?,
                        row.get::<_, u64>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, u64>(10)?,
                        row.get::<_, bool>(11)?,
                        row.get::<_, String>(12)?,
                        row.get::<_, Option<String>>(13)?,
                        row.get::<_, Option<String>>(14)?,
                        row.get::<_, Option<String>>(15)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        let Some((
            id,
            user_id,
            state,
            config,
            asked_count,
            answered_count,
            strike_minor_count,
            strike_major_count,
            tail_seq,
            tail_hash,
            token_generation,
            precheck_passed,
            created_at,
            started_at,
            sealed_at,
            end_cause,
        )) = row
        else {
            return Err(StoreError::NotFound {
                kind: "session",
                id: id.to_string(),
            });
        };

        let state = SessionState::parse(&state).ok_or_else(|| StoreError::Corrupt {
            id: id.clone(),
            reason: format!("unknown state {state:?}"),
        })?;
        let config: SessionConfig =
            serde_json::from_str(&config).map_err(|e| StoreError::Corrupt {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Session {
            user_id,
            state,
            config,
            asked_count,
            answered_count,
            strike_minor_count,
            strike_major_count,
            tail: Tail {
                seq: tail_seq,
                hash: tail_hash,
            },
            token_generation,
            precheck_passed,
            created_at: parse_ts(&id, &created_at)?,
            started_at: started_at.map(|ts| parse_ts(&id, &ts)).transpose()?,
            sealed_at: sealed_at.map(|ts| parse_ts(&id, &ts)).transpose()?,
            end_cause,
            id,
        })
    }

    /// Lists a user's sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC")?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Applies a state change with an optimistic guard on the current state.
    ///
    /// `bump_generation` invalidates outstanding AIPT/UPT tokens by
    /// incrementing the generation counter embedded in them. Entering
    /// `Active` stamps `started_at`; entering a terminal state stamps
    /// `sealed_at` and records the cause.
    ///
    /// # Errors
    ///
    /// [`StoreError::StateMoved`] if another writer changed the state first.
    pub fn set_state(
        &self,
        id: &str,
        from: SessionState,
        to: SessionState,
        cause: Option<&str>,
        bump_generation: bool,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET
                state = ?1,
                token_generation = token_generation + ?2,
                started_at = CASE WHEN ?3 THEN COALESCE(started_at, ?4) ELSE started_at END,
                sealed_at  = CASE WHEN ?5 THEN COALESCE(sealed_at, ?4) ELSE sealed_at END,
                end_cause  = CASE WHEN ?5 THEN COALESCE(end_cause, ?6) ELSE end_cause END
             WHERE id = ?7 AND state = ?8",
            params![
                to.as_str(),
                i64::from(bump_generation),
                to == SessionState::Active,
                now,
                to.is_terminal(),
                cause,
                id,
                from.as_str(),
            ],
        )?;
        if changed == 0 {
            drop(conn);
            // Distinguish a missing session from a lost race.
            self.get_session(id)?;
            return Err(StoreError::StateMoved { expected: from });
        }
        Ok(())
    }

    /// Records the outcome of the latest pre-check submission.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the session is unknown.
    pub fn set_precheck_passed(&self, id: &str, passed: bool) -> Result<(), StoreError> {
        let changed = self.lock().execute(
            "UPDATE sessions SET precheck_passed = ?1 WHERE id = ?2",
            params![passed, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "session",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Appends a question, assigning the next gapless ordinal.
    ///
    /// Rejects unless the session is `Active` and a slot remains. The insert
    /// and the `asked_count` bump commit in one transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidState`] outside `Active`;
    /// [`StoreError::NoSlotsRemaining`] when all slots are used.
    pub fn append_question(
        &self,
        session_id: &str,
        draft: &QuestionDraft,
    ) -> Result<Question, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let (state, asked, total) = tx
            .query_row(
                "SELECT state, asked_count,
                        CAST(json_extract(config, '$.questionCount') AS INTEGER)
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            })?;

        let state = SessionState::parse(&state).ok_or_else(|| StoreError::Corrupt {
            id: session_id.to_string(),
            reason: format!("unknown state {state:?}"),
        })?;
        if state != SessionState::Active {
            return Err(StoreError::InvalidState { state });
        }
        if asked >= total {
            return Err(StoreError::NoSlotsRemaining { asked });
        }

        let question = Question {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            ordinal: asked + 1,
            question_type: draft.question_type.clone(),
            text: draft.text.clone(),
            metadata: draft.metadata.clone(),
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO questions (id, session_id, ordinal, qtype, text, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                question.id,
                question.session_id,
                question.ordinal,
                question.question_type,
                question.text,
                question.metadata.to_string(),
                question.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET asked_count = asked_count + 1 WHERE id = ?1",
            params![session_id],
        )?;
        tx.commit()?;
        Ok(question)
    }

    /// Appends an answer for a question.
    ///
    /// Rejects unless the session is `Active`, the question exists in this
    /// session, and no answer exists for it yet.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidState`], [`StoreError::NotFound`], or
    /// [`StoreError::AnswerExists`].
    pub fn append_answer(
        &self,
        session_id: &str,
        question_id: &str,
        kind: &str,
        payload: &serde_json::Value,
        time_spent: Option<u32>,
    ) -> Result<Answer, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let state = tx
            .query_row(
                "SELECT state FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            })?;
        let state = SessionState::parse(&state).ok_or_else(|| StoreError::Corrupt {
            id: session_id.to_string(),
            reason: format!("unknown state {state:?}"),
        })?;
        if state != SessionState::Active {
            return Err(StoreError::InvalidState { state });
        }

        let question_known: bool = tx
            .query_row(
                "SELECT 1 FROM questions WHERE id = ?1 AND session_id = ?2",
                params![question_id, session_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !question_known {
            return Err(StoreError::NotFound {
                kind: "question",
                id: question_id.to_string(),
            });
        }

        let already: bool = tx
            .query_row(
                "SELECT 1 FROM answers WHERE question_id = ?1",
                params![question_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if already {
            return Err(StoreError::AnswerExists {
                question_id: question_id.to_string(),
            });
        }

        let answer = Answer {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            question_id: question_id.to_string(),
            kind: kind.to_string(),
            payload: payload.clone(),
            time_spent,
            feedback: None,
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO answers (id, session_id, question_id, kind, payload, time_spent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                answer.id,
                answer.session_id,
                answer.question_id,
                answer.kind,
                answer.payload.to_string(),
                answer.time_spent,
                answer.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET answered_count = answered_count + 1 WHERE id = ?1",
            params![session_id],
        )?;
        tx.commit()?;
        Ok(answer)
    }

    /// Attaches immediate feedback to an answer. The feedback slot is the
    /// only answer field written after insert, and only once.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the answer is unknown.
    pub fn set_answer_feedback(
        &self,
        answer_id: &str,
        feedback: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let changed = self.lock().execute(
            "UPDATE answers SET feedback = ?1 WHERE id = ?2 AND feedback IS NULL",
            params![feedback.to_string(), answer_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "answer",
                id: answer_id.to_string(),
            });
        }
        Ok(())
    }

    /// Persists a verified batch of chained events atomically and advances
    /// the stored tail.
    ///
    /// The caller passes the tail it verified against; if the stored tail
    /// moved in between, nothing is written. Under the service layer's
    /// per-session lock that cannot happen, but the guard keeps the
    /// append-only invariant independent of caller discipline.
    ///
    /// # Errors
    ///
    /// [`StoreError::TailMoved`] on a lost race;
    /// [`StoreError::InvalidState`] if the session is terminal.
    pub fn append_anticheat_batch(
        &self,
        session_id: &str,
        expected_tail: &Tail,
        linked: &[LinkedEvent],
        new_tail: &Tail,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let (state, tail_seq, tail_hash) = tx
            .query_row(
                "SELECT state, tail_seq, tail_hash FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                kind: "session",
                id: session_id.to_string(),
            })?;
        let state = SessionState::parse(&state).ok_or_else(|| StoreError::Corrupt {
            id: session_id.to_string(),
            reason: format!("unknown state {state:?}"),
        })?;
        if state.is_terminal() {
            return Err(StoreError::InvalidState { state });
        }
        if tail_seq != expected_tail.seq || tail_hash != expected_tail.hash {
            return Err(StoreError::TailMoved);
        }

        let now = Utc::now().to_rfc3339();
        for item in linked {
            tx.execute(
                "INSERT INTO anti_cheat_events
                     (session_id, seq, etype, details, ts, prev_hash, hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    session_id,
                    item.event.seq,
                    item.event.event_type,
                    item.event.details.to_string(),
                    item.event.ts,
                    item.event.prev_hash,
                    item.hash,
                    now,
                ],
            )?;
        }
        tx.execute(
            "UPDATE sessions SET tail_seq = ?1, tail_hash = ?2 WHERE id = ?3",
            params![new_tail.seq, new_tail.hash, session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Records strikes and bumps the session's severity counters in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on write failure.
    pub fn record_strikes(&self, strikes: &[Strike]) -> Result<(), StoreError> {
        if strikes.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for strike in strikes {
            tx.execute(
                "INSERT INTO strikes (id, session_id, severity, etype, seq, action, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    strike.id,
                    strike.session_id,
                    strike.severity.as_str(),
                    strike.event_type,
                    strike.seq,
                    strike.action.as_str(),
                    strike.created_at,
                ],
            )?;
            let column = match strike.severity {
                StrikeSeverity::Minor => "strike_minor",
                StrikeSeverity::Major => "strike_major",
            };
            tx.execute(
                &format!("UPDATE sessions SET {column} = {column} + 1 WHERE id = ?1"),
                params![strike.session_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Counts prior strikes for an event type in a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn count_strikes_for_type(
        &self,
        session_id: &str,
        event_type: &str,
    ) -> Result<u32, StoreError> {
        let count = self.lock().query_row(
            "SELECT COUNT(*) FROM strikes WHERE session_id = ?1 AND etype = ?2",
            params![session_id, event_type],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(count)
    }

    /// Writes the session summary. Idempotent: a second write returns the
    /// original summary id and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on write failure.
    pub fn write_summary(
        &self,
        session_id: &str,
        summary: &serde_json::Value,
    ) -> Result<String, StoreError> {
        let conn = self.lock();
        if let Some(existing) = conn
            .query_row(
                "SELECT summary_id FROM summaries WHERE session_id = ?1",
                params![session_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        {
            return Ok(existing);
        }
        let summary_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO summaries (session_id, summary_id, summary, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                session_id,
                summary_id,
                summary.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(summary_id)
    }

    /// Loads the summary for a session.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no summary was written.
    pub fn get_summary(&self, session_id: &str) -> Result<(String, serde_json::Value), StoreError> {
        let row = self
            .lock()
            .query_row(
                "SELECT summary_id, summary FROM summaries WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((summary_id, raw)) = row else {
            return Err(StoreError::NotFound {
                kind: "summary",
                id: session_id.to_string(),
            });
        };
        let value = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
            id: session_id.to_string(),
            reason: e.to_string(),
        })?;
        Ok((summary_id, value))
    }

    /// Lists a session's questions in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn list_questions(&self, session_id: &str) -> Result<Vec<Question>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ordinal, qtype, text, metadata, created_at
             FROM questions WHERE session_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut questions = Vec::new();
        for row in rows {
            let (id, ordinal, question_type, text, metadata, created_at) = row?;
            questions.push(Question {
                metadata: serde_json::from_str(&metadata).map_err(|e| StoreError::Corrupt {
                    id: id.clone(),
                    reason: e.to_string(),
                })?,
                created_at: parse_ts(&id, &created_at)?,
                id,
                session_id: session_id.to_string(),
                ordinal,
                question_type,
                text,
            });
        }
        Ok(questions)
    }

    /// Loads one question.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if unknown in this session.
    pub fn get_question(&self, session_id: &str, question_id: &str) -> Result<Question, StoreError> {
        self.list_questions(session_id)?
            .into_iter()
            .find(|q| q.id == question_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "question",
                id: question_id.to_string(),
            })
    }

    /// Lists a session's answers in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn list_answers(&self, session_id: &str) -> Result<Vec<Answer>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, question_id, kind, payload, time_spent, feedback, created_at
             FROM answers WHERE session_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<u32>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut answers = Vec::new();
        for row in rows {
            let (id, question_id, kind, payload, time_spent, feedback, created_at) = row?;
            answers.push(Answer {
                payload: serde_json::from_str(&payload).map_err(|e| StoreError::Corrupt {
                    id: id.clone(),
                    reason: e.to_string(),
                })?,
                feedback: feedback
                    .map(|raw| {
                        serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                            id: id.clone(),
                            reason: e.to_string(),
                        })
                    })
                    .transpose()?,
                created_at: parse_ts(&id, &created_at)?,
                id,
                session_id: session_id.to_string(),
                question_id,
                kind,
                time_spent,
            });
        }
        Ok(answers)
    }

    /// Lists a session's strikes in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn list_strikes(&self, session_id: &str) -> Result<Vec<Strike>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, severity, etype, seq, action, created_at
             FROM strikes WHERE session_id = ?1 ORDER BY created_at, seq",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut strikes = Vec::new();
        for row in rows {
            let (id, severity, event_type, seq, action, created_at) = row?;
            strikes.push(Strike {
                severity: match severity.as_str() {
                    "minor" => StrikeSeverity::Minor,
                    _ => StrikeSeverity::Major,
                },
                action: match action.as_str() {
                    "pause" => StrikeAction::Pause,
                    "end" => StrikeAction::End,
                    _ => StrikeAction::None,
                },
                id,
                session_id: session_id.to_string(),
                event_type,
                seq,
                created_at,
            });
        }
        Ok(strikes)
    }

    /// Lists a session's anti-cheat events in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on query failure.
    pub fn list_events(&self, session_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, etype, details, ts, prev_hash, hash
             FROM anti_cheat_events WHERE session_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (seq, event_type, details, ts, prev_hash, hash) = row?;
            events.push(StoredEvent {
                details: serde_json::from_str(&details).map_err(|e| StoreError::Corrupt {
                    id: format!("{session_id}/{seq}"),
                    reason: e.to_string(),
                })?,
                session_id: session_id.to_string(),
                seq,
                event_type,
                ts,
                prev_hash,
                hash,
            });
        }
        Ok(events)
    }

    /// Deletes a session and, via cascade, its whole record tree.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the session is unknown.
    pub fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let changed = self
            .lock()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: "session",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_ts(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
}
