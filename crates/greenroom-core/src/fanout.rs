//! Per-session live event fan-out.
//!
//! Each session gets an ordered in-memory event log (fixed-capacity ring) and
//! a list of subscribers. Publishing is non-blocking for the publisher: a
//! subscriber whose buffer is full is evicted (its stream closes with
//! `slow_consumer`) rather than back-pressuring a writer that may hold the
//! session lock.
//!
//! Frames carry a stable monotonic id per session, so a reconnecting client
//! can pass `since=<id>` and replay whatever the ring still holds.
//!
//! Single-instance note: for multi-instance deployments this component is the
//! one to swap for an external broker keyed by session id; the contract
//! (ordered, per-session, lossy-on-slow) is unchanged.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

/// Frames retained per session for `since` replay.
pub const RING_CAPACITY: usize = 256;

/// Per-subscriber buffered frames before eviction.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Events delivered on the duplex stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// A question row became durable.
    QuestionCreated {
        /// Question id.
        question_id: String,
        /// 1-based ordinal.
        question_number: u32,
        /// Question type.
        question_type: String,
    },
    /// An answer row became durable.
    AnswerRecorded {
        /// Answered question.
        question_id: String,
        /// Answer id.
        answer_id: String,
    },
    /// A strike was recorded.
    StrikeCreated {
        /// Severity: `minor` | `major`.
        severity: String,
        /// Triggering event type.
        event_type: String,
        /// Triggering event seq.
        seq: u64,
        /// Action taken: `none` | `pause` | `end`.
        action: String,
    },
    /// The session auto-paused.
    SessionPaused {
        /// Cause string.
        cause: String,
    },
    /// The session resumed.
    SessionResumed {},
    /// The session ended. Terminal.
    SessionEnded {
        /// Cause string.
        cause: String,
    },
    /// The session completed normally. Terminal.
    SessionCompleted {},
    /// Immediate feedback was attached to an answer.
    FeedbackCreated {
        /// Answered question.
        question_id: String,
        /// Feedback blob.
        feedback: serde_json::Value,
    },
}

impl SessionEvent {
    /// Whether this frame ends the stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionEnded { .. } | Self::SessionCompleted {})
    }

    /// The wire `type` discriminator.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::QuestionCreated { .. } => "QUESTION_CREATED",
            Self::AnswerRecorded { .. } => "ANSWER_RECORDED",
            Self::StrikeCreated { .. } => "STRIKE_CREATED",
            Self::SessionPaused { .. } => "SESSION_PAUSED",
            Self::SessionResumed {} => "SESSION_RESUMED",
            Self::SessionEnded { .. } => "SESSION_ENDED",
            Self::SessionCompleted {} => "SESSION_COMPLETED",
            Self::FeedbackCreated { .. } => "FEEDBACK_CREATED",
        }
    }
}

/// One frame on the stream: a session event plus its monotonic id.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamFrame {
    /// Monotonic per-session frame id.
    pub id: u64,
    /// The event.
    #[serde(flatten)]
    pub event: SessionEvent,
}

struct Room {
    next_id: u64,
    ring: VecDeque<StreamFrame>,
    subscribers: Vec<mpsc::Sender<StreamFrame>>,
}

impl Room {
    fn new() -> Self {
        Self {
            next_id: 0,
            ring: VecDeque::with_capacity(RING_CAPACITY),
            subscribers: Vec::new(),
        }
    }
}

/// The per-session publish-subscribe bus.
#[derive(Default)]
pub struct EventBus {
    rooms: Mutex<HashMap<String, Room>>,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event to a session's subscribers and ring.
    ///
    /// Never blocks. Subscribers whose buffer is full are evicted; their
    /// receiver drains what was already buffered and then observes closure.
    /// Returns the assigned frame id.
    pub fn publish(&self, session_id: &str, event: SessionEvent) -> u64 {
        let mut rooms = self
            .rooms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let room = rooms
            .entry(session_id.to_string())
            .or_insert_with(Room::new);
        room.next_id += 1;
        let frame = StreamFrame {
            id: room.next_id,
            event,
        };

        if room.ring.len() == RING_CAPACITY {
            room.ring.pop_front();
        }
        room.ring.push_back(frame.clone());

        let terminal = frame.event.is_terminal();
        room.subscribers
            .retain(|tx| match tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_) | mpsc::error::TrySendError::Closed(_)) => {
                    false
                }
            });
        if terminal {
            // Dropping the senders closes every stream once its buffer
            // (ending in the terminal frame) drains.
            room.subscribers.clear();
        }
        frame.id
    }

    /// Subscribes to a session's stream.
    ///
    /// Returns any still-buffered frames with id greater than `since`
    /// (replayed synchronously) and a receiver for subsequent frames.
    pub fn subscribe(
        &self,
        session_id: &str,
        since: Option<u64>,
    ) -> (Vec<StreamFrame>, mpsc::Receiver<StreamFrame>) {
        let mut rooms = self
            .rooms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let room = rooms
            .entry(session_id.to_string())
            .or_insert_with(Room::new);
        let replay = match since {
            None => Vec::new(),
            Some(after) => room
                .ring
                .iter()
                .filter(|f| f.id > after)
                .cloned()
                .collect(),
        };
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        room.subscribers.push(tx);
        (replay, rx)
    }

    /// Number of live subscribers for a session (tests and diagnostics).
    #[must_use]
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.rooms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .map_or(0, |room| room.subscribers.len())
    }

    /// Drops a session's room entirely (cascade delete path).
    pub fn remove_session(&self, session_id: &str) {
        self.rooms
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(n: u32) -> SessionEvent {
        SessionEvent::QuestionCreated {
            question_id: format!("q{n}"),
            question_number: n,
            question_type: "behavioral".into(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_sees_publish_order() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe("s1", None);
        for n in 1..=5 {
            bus.publish("s1", question(n));
        }
        for n in 1..=5u64 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.id, n);
        }
    }

    #[tokio::test]
    async fn test_frame_ids_monotonic_per_session() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("a", question(1)), 1);
        assert_eq!(bus.publish("a", question(2)), 2);
        assert_eq!(bus.publish("b", question(1)), 1);
    }

    #[tokio::test]
    async fn test_since_replay() {
        let bus = EventBus::new();
        for n in 1..=4 {
            bus.publish("s1", question(n));
        }
        let (replay, _rx) = bus.subscribe("s1", Some(2));
        let ids: Vec<u64> = replay.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_slow_subscriber_evicted_without_blocking() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe("s1", None);
        // Exceed the buffer without draining.
        for n in 0..=(SUBSCRIBER_BUFFER as u32 + 4) {
            bus.publish("s1", question(n));
        }
        assert_eq!(bus.subscriber_count("s1"), 0);
        // Buffered frames remain readable, then the channel closes.
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn test_terminal_frame_closes_all_streams() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe("s1", None);
        bus.publish("s1", question(1));
        bus.publish(
            "s1",
            SessionEvent::SessionEnded {
                cause: "policy_breach".into(),
            },
        );
        assert_eq!(bus.subscriber_count("s1"), 0);
        assert!(matches!(
            rx.recv().await.unwrap().event,
            SessionEvent::QuestionCreated { .. }
        ));
        let last = rx.recv().await.unwrap();
        assert!(last.event.is_terminal());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_wire_shape() {
        let frame = StreamFrame {
            id: 7,
            event: SessionEvent::StrikeCreated {
                severity: "major".into(),
                event_type: "FS_EXIT".into(),
                seq: 3,
                action: "pause".into(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["type"], "STRIKE_CREATED");
        assert_eq!(value["eventType"], "FS_EXIT");
    }
}
