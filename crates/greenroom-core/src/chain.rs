//! Tamper-evident anti-cheat event chain.
//!
//! Every session owns a strictly monotonic log of browser-reported
//! environment events. Each event names its predecessor by hash, so the
//! server only has to track the tail `(seq, hash)` pair to detect gaps,
//! replays, and rewrites:
//!
//! ```text
//! e1 { seq: 1, prevHash: "" }
//! e2 { seq: 2, prevHash: hash(canonical(e1)) }
//! e3 { seq: 3, prevHash: hash(canonical(e2)) }
//! ```
//!
//! The canonical encoding is JSON with a fixed field order over
//! `{sessionId, seq, type, details, ts, prevHash}`; nested objects inside
//! `details` serialize with sorted keys. The digest is SHA-256, hex-encoded
//! lower-case.
//!
//! Verification is pure: [`verify_batch`] checks a candidate batch against a
//! stored tail and computes every link hash without touching storage, so the
//! store can persist an accepted batch atomically afterwards.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hash value of the empty chain (before the first event).
pub const EMPTY_TAIL_HASH: &str = "";

/// Maximum events accepted in a single batch.
pub const MAX_BATCH_LEN: usize = 256;

/// A browser-reported anti-cheat event as submitted by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AntiCheatEvent {
    /// Owning session.
    pub session_id: String,
    /// Strictly monotonic sequence number, starting at 1.
    pub seq: u64,
    /// Event type, e.g. `FS_EXIT`, `TAB_SWITCH`, `SCREENSHOT_ATTEMPT`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque details blob.
    #[serde(default)]
    pub details: serde_json::Value,
    /// Client timestamp, ISO-8601 UTC.
    pub ts: String,
    /// Hash of the predecessor's canonical encoding; empty for seq 1.
    pub prev_hash: String,
}

/// The `(seq, hash)` pair identifying the most recent accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tail {
    /// Sequence number of the last accepted event; 0 for an empty chain.
    pub seq: u64,
    /// Hash of the last accepted event; empty for an empty chain.
    pub hash: String,
}

impl Tail {
    /// The tail of an empty chain.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            seq: 0,
            hash: EMPTY_TAIL_HASH.to_string(),
        }
    }
}

/// Chain verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    /// The batch does not extend the stored tail, or an inner link is
    /// inconsistent. The stored tail is echoed so the client can re-sync.
    #[error("event chain broken at seq {at_seq} (stored tail seq {tail_seq})")]
    Broken {
        /// Sequence number of the offending event.
        at_seq: u64,
        /// Stored tail sequence at verification time.
        tail_seq: u64,
        /// Stored tail hash at verification time.
        tail_hash: String,
    },

    /// The batch is empty.
    #[error("event batch is empty")]
    EmptyBatch,

    /// The batch exceeds [`MAX_BATCH_LEN`].
    #[error("event batch too large: {len} events (max {max})")]
    BatchTooLarge {
        /// Submitted batch length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// An event names a session other than the one being extended.
    #[error("event at seq {at_seq} names a foreign session")]
    ForeignSession {
        /// Sequence number of the offending event.
        at_seq: u64,
    },
}

/// Canonical encoding of an event: fixed field order, sorted nested keys.
///
/// `serde_json` maps are backed by `BTreeMap`, so nested objects inside
/// `details` already serialize with sorted keys; the top level is emitted in
/// the documented order explicitly.
#[must_use]
pub fn canonical(event: &AntiCheatEvent) -> String {
    let mut out = String::from("{");
    out.push_str(&format!(
        "\"sessionId\":{},",
        serde_json::Value::from(event.session_id.as_str())
    ));
    out.push_str(&format!("\"seq\":{},", event.seq));
    out.push_str(&format!(
        "\"type\":{},",
        serde_json::Value::from(event.event_type.as_str())
    ));
    out.push_str(&format!("\"details\":{},", event.details));
    out.push_str(&format!(
        "\"ts\":{},",
        serde_json::Value::from(event.ts.as_str())
    ));
    out.push_str(&format!(
        "\"prevHash\":{}",
        serde_json::Value::from(event.prev_hash.as_str())
    ));
    out.push('}');
    out
}

/// SHA-256 of the canonical encoding, hex-encoded lower-case.
#[must_use]
pub fn event_hash(event: &AntiCheatEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical(event).as_bytes());
    hex::encode(hasher.finalize())
}

/// An accepted event together with its computed hash, ready to persist.
#[derive(Debug, Clone)]
pub struct LinkedEvent {
    /// The event as submitted.
    pub event: AntiCheatEvent,
    /// Hash of the event's canonical encoding.
    pub hash: String,
}

/// Verifies a candidate batch against the stored tail.
///
/// Acceptance rules:
///
/// 1. the first event must have `seq == tail.seq + 1` and
///    `prev_hash == tail.hash`;
/// 2. each subsequent event must have `seq == previous.seq + 1` and
///    `prev_hash == hash(canonical(previous))`;
/// 3. every event must name `session_id`.
///
/// On success returns the linked events (with computed hashes) and the new
/// tail. The whole batch is rejected on the first violation; nothing about
/// the stored chain changes.
///
/// # Errors
///
/// [`ChainError::Broken`] carries the stored tail for client re-sync.
pub fn verify_batch(
    session_id: &str,
    tail: &Tail,
    events: &[AntiCheatEvent],
) -> Result<(Vec<LinkedEvent>, Tail), ChainError> {
    if events.is_empty() {
        return Err(ChainError::EmptyBatch);
    }
    if events.len() > MAX_BATCH_LEN {
        return Err(ChainError::BatchTooLarge {
            len: events.len(),
            max: MAX_BATCH_LEN,
        });
    }

    let mut linked = Vec::with_capacity(events.len());
    let mut expected_seq = tail.seq + 1;
    let mut expected_prev = tail.hash.clone();

    for event in events {
        if event.session_id != session_id {
            return Err(ChainError::ForeignSession { at_seq: event.seq });
        }
        if event.seq != expected_seq || event.prev_hash != expected_prev {
            return Err(ChainError::Broken {
                at_seq: event.seq,
                tail_seq: tail.seq,
                tail_hash: tail.hash.clone(),
            });
        }
        let hash = event_hash(event);
        expected_seq += 1;
        expected_prev.clone_from(&hash);
        linked.push(LinkedEvent {
            event: event.clone(),
            hash,
        });
    }

    let new_tail = Tail {
        seq: expected_seq - 1,
        hash: expected_prev,
    };
    Ok((linked, new_tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64, prev_hash: &str) -> AntiCheatEvent {
        AntiCheatEvent {
            session_id: "s1".into(),
            seq,
            event_type: "FS_READY".into(),
            details: serde_json::json!({}),
            ts: "2025-11-02T12:00:00Z".into(),
            prev_hash: prev_hash.into(),
        }
    }

    #[test]
    fn test_canonical_field_order_is_stable() {
        let e = AntiCheatEvent {
            session_id: "s1".into(),
            seq: 1,
            event_type: "FS_READY".into(),
            details: serde_json::json!({"z": 1, "a": 2}),
            ts: "2025-11-02T12:00:00Z".into(),
            prev_hash: String::new(),
        };
        let encoded = canonical(&e);
        assert_eq!(
            encoded,
            "{\"sessionId\":\"s1\",\"seq\":1,\"type\":\"FS_READY\",\
             \"details\":{\"a\":2,\"z\":1},\"ts\":\"2025-11-02T12:00:00Z\",\"prevHash\":\"\"}"
        );
    }

    #[test]
    fn test_single_event_extends_empty_tail() {
        let (linked, tail) = verify_batch("s1", &Tail::empty(), &[event(1, "")]).unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(tail.seq, 1);
        assert_eq!(tail.hash, linked[0].hash);
        assert_eq!(tail.hash.len(), 64);
        assert_eq!(tail.hash, tail.hash.to_lowercase());
    }

    #[test]
    fn test_multi_event_batch_links() {
        let e1 = event(1, "");
        let h1 = event_hash(&e1);
        let e2 = event(2, &h1);
        let h2 = event_hash(&e2);
        let e3 = event(3, &h2);

        let (linked, tail) = verify_batch("s1", &Tail::empty(), &[e1, e2, e3.clone()]).unwrap();
        assert_eq!(linked.len(), 3);
        assert_eq!(tail.seq, 3);
        assert_eq!(tail.hash, event_hash(&e3));
    }

    #[test]
    fn test_gap_rejected_with_stored_tail() {
        let e1 = event(1, "");
        let h1 = event_hash(&e1);
        let stored = Tail {
            seq: 1,
            hash: h1.clone(),
        };
        // seq 3 submitted where 2 is expected.
        let err = verify_batch("s1", &stored, &[event(3, &h1)]).unwrap_err();
        assert_eq!(
            err,
            ChainError::Broken {
                at_seq: 3,
                tail_seq: 1,
                tail_hash: h1,
            }
        );
    }

    #[test]
    fn test_replay_rejected() {
        let e1 = event(1, "");
        let stored = Tail {
            seq: 1,
            hash: event_hash(&e1),
        };
        let err = verify_batch("s1", &stored, &[event(1, "")]).unwrap_err();
        assert!(matches!(err, ChainError::Broken { at_seq: 1, .. }));
    }

    #[test]
    fn test_bad_inner_link_rejects_whole_batch() {
        let e1 = event(1, "");
        let h1 = event_hash(&e1);
        let bad_second = event(2, "deadbeef");
        let err = verify_batch("s1", &Tail::empty(), &[e1, bad_second]).unwrap_err();
        assert!(matches!(err, ChainError::Broken { at_seq: 2, .. }));
        let _ = h1;
    }

    #[test]
    fn test_rewritten_details_change_hash() {
        let mut e = event(1, "");
        let original = event_hash(&e);
        e.details = serde_json::json!({"injected": true});
        assert_ne!(original, event_hash(&e));
    }

    #[test]
    fn test_foreign_session_rejected() {
        let mut e = event(1, "");
        e.session_id = "other".into();
        let err = verify_batch("s1", &Tail::empty(), &[e]).unwrap_err();
        assert_eq!(err, ChainError::ForeignSession { at_seq: 1 });
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert_eq!(
            verify_batch("s1", &Tail::empty(), &[]).unwrap_err(),
            ChainError::EmptyBatch
        );
    }
}
