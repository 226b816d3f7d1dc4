//! Ordered, replayable event stream for run observation.
//!
//! Events carry monotonically increasing ids per stream. Live observers
//! subscribe to a broadcast channel; late joiners replay the retained log
//! from any id and then switch to the live feed. Emission never blocks the
//! orchestrator: a lagging subscriber drops its own messages, the retained
//! log stays complete.

use crate::routing::RouteDecision;
use crate::runstate::RunStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

/// What happened, in the closed event vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Run status transition
    StateChanged {
        from: RunStatus,
        to: RunStatus,
    },
    /// A step was dispatched to the execution engine
    StepStarted {
        flow: String,
        step: String,
        /// Content hash of the dispatched instruction plan
        plan_hash: String,
    },
    /// A step's handoff result was accepted
    StepCompleted {
        flow: String,
        step: String,
        status: String,
    },
    /// The routing engine decided what happens next
    RoutingDecision {
        decision: RouteDecision,
    },
    DetourStarted {
        reason: String,
        classification: String,
    },
    DetourCompleted {
        resumed_at: String,
    },
    Warning {
        code: String,
        message: String,
    },
    Error {
        message: String,
    },
}

/// One event on a run's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic id within the stream, starting at 1
    pub id: u64,
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Broadcast stream with a retained, replayable log.
pub struct EventStream {
    sender: broadcast::Sender<Event>,
    retained: Mutex<Vec<Event>>,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStream {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            retained: Mutex::new(Vec::new()),
        }
    }

    /// Append an event, assign its id, and fan it out to live subscribers.
    /// Returns the assigned id.
    pub fn emit(&self, run_id: Uuid, kind: EventKind) -> u64 {
        let mut retained = self.retained.lock().expect("event log poisoned");
        let event = Event {
            id: retained.len() as u64 + 1,
            run_id,
            at: Utc::now(),
            kind,
        };
        let id = event.id;
        retained.push(event.clone());
        drop(retained);
        // No live subscribers is fine; the log is the source of truth
        let _ = self.sender.send(event);
        id
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Replay retained events with id greater than `after`, oldest first.
    pub fn replay_from(&self, after: u64) -> Vec<Event> {
        self.retained
            .lock()
            .expect("event log poisoned")
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect()
    }

    /// Retained events for one run, oldest first.
    pub fn for_run(&self, run_id: Uuid) -> Vec<Event> {
        self.retained
            .lock()
            .expect("event log poisoned")
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warning(code: &str) -> EventKind {
        EventKind::Warning {
            code: code.to_string(),
            message: "msg".to_string(),
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let stream = EventStream::new();
        let run = Uuid::new_v4();
        assert_eq!(stream.emit(run, warning("a")), 1);
        assert_eq!(stream.emit(run, warning("b")), 2);
        assert_eq!(stream.emit(run, warning("c")), 3);
    }

    #[test]
    fn test_replay_from_offset() {
        let stream = EventStream::new();
        let run = Uuid::new_v4();
        for code in ["a", "b", "c", "d"] {
            stream.emit(run, warning(code));
        }
        let tail = stream.replay_from(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, 3);
        assert_eq!(tail[1].id, 4);
        assert_eq!(stream.replay_from(0).len(), 4);
    }

    #[test]
    fn test_for_run_filters() {
        let stream = EventStream::new();
        let one = Uuid::new_v4();
        let two = Uuid::new_v4();
        stream.emit(one, warning("a"));
        stream.emit(two, warning("b"));
        stream.emit(one, warning("c"));

        let events = stream.for_run(one);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.run_id == one));
    }

    #[tokio::test]
    async fn test_live_subscription() {
        let stream = EventStream::new();
        let run = Uuid::new_v4();
        let mut rx = stream.subscribe();

        stream.emit(
            run,
            EventKind::StateChanged {
                from: RunStatus::Pending,
                to: RunStatus::Running,
            },
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, 1);
        assert!(matches!(event.kind, EventKind::StateChanged { .. }));
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let stream = EventStream::new();
        stream.emit(Uuid::new_v4(), warning("orphan"));
        assert_eq!(stream.replay_from(0).len(), 1);
    }

    #[test]
    fn test_event_serialization_flattens_kind() {
        let stream = EventStream::new();
        let run = Uuid::new_v4();
        stream.emit(
            run,
            EventKind::StepStarted {
                flow: "delivery".to_string(),
                step: "build".to_string(),
                plan_hash: "abc123".to_string(),
            },
        );
        let event = &stream.replay_from(0)[0];
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["kind"], "step_started");
        assert_eq!(json["step"], "build");
        assert_eq!(json["id"], 1);
    }
}
