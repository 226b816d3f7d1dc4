//! Run state: the durable program counter of one orchestrated run.
//!
//! A run state is an explicitly passed, serializable value with no ambient
//! globals. All mutation funnels through the orchestrator loop and the
//! store; everything else reads snapshots. Runs are never deleted, only
//! marked terminal, so the snapshot history doubles as the audit trail.

mod store;

pub use store::RunStateStore;

use crate::flow::{FlowNode, StepRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Halted pending external remediation; resumable
    Interrupted,
    /// Cleanly stopped on request; terminal, distinct from failed
    Stopped,
}

impl RunStatus {
    /// Terminal states. `Interrupted` is not terminal; it waits for
    /// remediation and resume.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }
}

/// Why a frame was pushed and what it injected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InjectionTarget {
    /// A pre-catalogued detour: node ids within the interrupted flow
    Detour { nodes: Vec<String> },
    /// A whole catalogued flow, entered at its entry node
    Flow { flow: String },
    /// An ad-hoc node sequence not present in any catalogued flow
    Nodes { nodes: Vec<FlowNode> },
}

impl InjectionTarget {
    /// Classification label recorded in events and snapshots.
    pub fn classification(&self) -> &'static str {
        match self {
            InjectionTarget::Detour { .. } => "detour",
            InjectionTarget::Flow { .. } => "inject_flow",
            InjectionTarget::Nodes { .. } => "inject_nodes",
        }
    }
}

/// One record in the interruption stack. Pushed when a detour/injection is
/// decided, popped only when the detour reports a terminal return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Position that was paused
    pub interrupted: StepRef,
    /// Stable reason code for the interruption
    pub reason: String,
    /// What was injected in its place
    pub target: InjectionTarget,
    /// Steps of the injection not yet executed (front is next)
    pub pending: Vec<String>,
    pub pushed_at: DateTime<Utc>,
}

/// Warning recorded into a snapshot without aborting the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWarning {
    /// Stable code, e.g. `spec_drift`
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
    /// Snapshot sequence the warning was recorded at
    pub seq: u64,
}

/// The full state of one run. Serialized whole into every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    /// Active flow id
    pub flow: String,
    /// Active step id within the active flow (or injected sequence)
    pub step: String,
    pub status: RunStatus,
    /// Monotonic snapshot sequence number, advanced by the store
    pub seq: u64,
    /// Frames for paused positions, newest last
    pub interruption_stack: Vec<StackFrame>,
    /// Mirrored save-points for returning from frames, newest last
    pub resume_stack: Vec<StepRef>,
    /// Version fingerprints captured at first reference: key → token
    pub fingerprints: BTreeMap<String, String>,
    /// Ad-hoc nodes injected into this run
    pub injected_nodes: Vec<FlowNode>,
    /// Consecutive reruns of the current step
    pub retry_count: u32,
    /// Iterations of the current microloop
    pub microloop_count: u32,
    /// Total steps dispatched over the run's lifetime
    pub iteration: u32,
    pub warnings: Vec<RunWarning>,
    pub stop_requested: bool,
    pub pause_requested: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(run_id: Uuid, flow: &str, entry: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            flow: flow.to_string(),
            step: entry.to_string(),
            status: RunStatus::Pending,
            seq: 0,
            interruption_stack: Vec::new(),
            resume_stack: Vec::new(),
            fingerprints: BTreeMap::new(),
            injected_nodes: Vec::new(),
            retry_count: 0,
            microloop_count: 0,
            iteration: 0,
            warnings: Vec::new(),
            stop_requested: false,
            pause_requested: false,
            started_at: now,
            updated_at: now,
        }
    }

    /// Current position as a step reference.
    pub fn position(&self) -> StepRef {
        StepRef::new(&self.flow, &self.step)
    }

    /// Move to a new position, resetting the per-step counters.
    pub fn advance_to(&mut self, position: StepRef, status: RunStatus) {
        self.flow = position.flow;
        self.step = position.step;
        self.status = status;
        self.retry_count = 0;
        self.microloop_count = 0;
        self.updated_at = Utc::now();
    }

    /// Push an interruption frame and its mirrored resume point, then move
    /// to the injection's first step.
    pub fn push_frame(&mut self, frame: StackFrame, resume_at: StepRef) {
        self.resume_stack.push(resume_at);
        let first = frame.pending.first().cloned();
        let flow = match &frame.target {
            InjectionTarget::Flow { flow } => flow.clone(),
            _ => self.flow.clone(),
        };
        if let InjectionTarget::Nodes { nodes } = &frame.target {
            self.injected_nodes.extend(nodes.iter().cloned());
        }
        self.interruption_stack.push(frame);
        if let Some(step) = first {
            self.flow = flow;
            self.step = step;
        }
        self.retry_count = 0;
        self.microloop_count = 0;
        self.updated_at = Utc::now();
    }

    /// Pop the newest frame and restore its resume point. Returns the
    /// popped frame, or `None` on an empty stack.
    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        let frame = self.interruption_stack.pop()?;
        if let Some(resume) = self.resume_stack.pop() {
            self.flow = resume.flow;
            self.step = resume.step;
        }
        self.retry_count = 0;
        self.microloop_count = 0;
        self.updated_at = Utc::now();
        Some(frame)
    }

    /// Current injection nesting depth.
    pub fn injection_depth(&self) -> usize {
        self.interruption_stack.len()
    }

    /// A run may only terminate non-failed with a balanced (empty) stack.
    pub fn stacks_balanced(&self) -> bool {
        self.interruption_stack.is_empty() && self.resume_stack.is_empty()
    }

    /// Capture a fingerprint on first sighting; on a later mismatch record
    /// a `spec_drift` warning and keep the original. Never aborts.
    pub fn observe_fingerprint(&mut self, key: &str, token: &str) {
        match self.fingerprints.get(key) {
            None => {
                self.fingerprints.insert(key.to_string(), token.to_string());
            }
            Some(captured) if captured != token => {
                let message = format!(
                    "{key} changed since run start: captured {captured}, now {token}"
                );
                tracing::warn!(run_id = %self.run_id, %key, "spec drift detected");
                self.warn("spec_drift", &message);
            }
            Some(_) => {}
        }
    }

    /// Append a warning tagged with the current snapshot sequence.
    pub fn warn(&mut self, code: &str, message: &str) {
        self.warnings.push(RunWarning {
            code: code.to_string(),
            message: message.to_string(),
            at: Utc::now(),
            seq: self.seq,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RunState {
        RunState::new(Uuid::new_v4(), "delivery", "a")
    }

    fn frame(pending: Vec<&str>) -> StackFrame {
        StackFrame {
            interrupted: StepRef::new("delivery", "b"),
            reason: "env_broken".to_string(),
            target: InjectionTarget::Detour {
                nodes: pending.iter().map(|s| s.to_string()).collect(),
            },
            pending: pending.into_iter().map(String::from).collect(),
            pushed_at: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Interrupted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_advance_resets_counters() {
        let mut state = state();
        state.retry_count = 2;
        state.microloop_count = 3;
        state.advance_to(StepRef::new("delivery", "b"), RunStatus::Running);
        assert_eq!(state.step, "b");
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.microloop_count, 0);
    }

    #[test]
    fn test_push_and_pop_frame_balance() {
        let mut state = state();
        state.advance_to(StepRef::new("delivery", "b"), RunStatus::Running);

        state.push_frame(frame(vec!["fix_env"]), StepRef::new("delivery", "c"));
        assert_eq!(state.step, "fix_env");
        assert_eq!(state.injection_depth(), 1);
        assert!(!state.stacks_balanced());

        let popped = state.pop_frame().unwrap();
        assert_eq!(popped.reason, "env_broken");
        assert_eq!(state.position(), StepRef::new("delivery", "c"));
        assert!(state.stacks_balanced());
    }

    #[test]
    fn test_pop_empty_stack_returns_none() {
        let mut state = state();
        assert!(state.pop_frame().is_none());
    }

    #[test]
    fn test_nested_frames_pop_in_order() {
        let mut state = state();
        state.push_frame(frame(vec!["x"]), StepRef::new("delivery", "b"));
        state.push_frame(frame(vec!["y"]), StepRef::new("delivery", "x"));
        assert_eq!(state.injection_depth(), 2);

        state.pop_frame().unwrap();
        assert_eq!(state.position(), StepRef::new("delivery", "x"));
        state.pop_frame().unwrap();
        assert_eq!(state.position(), StepRef::new("delivery", "b"));
        assert!(state.stacks_balanced());
    }

    #[test]
    fn test_inject_flow_switches_active_flow() {
        let mut state = state();
        let inject = StackFrame {
            interrupted: StepRef::new("delivery", "b"),
            reason: "needs_design".to_string(),
            target: InjectionTarget::Flow {
                flow: "design".to_string(),
            },
            pending: vec!["entry".to_string()],
            pushed_at: Utc::now(),
        };
        state.push_frame(inject, StepRef::new("delivery", "c"));
        assert_eq!(state.flow, "design");
        assert_eq!(state.step, "entry");

        state.pop_frame().unwrap();
        assert_eq!(state.flow, "delivery");
        assert_eq!(state.step, "c");
    }

    #[test]
    fn test_fingerprint_capture_and_drift() {
        let mut state = state();
        state.observe_fingerprint("flow:delivery", "token-1");
        assert!(state.warnings.is_empty());

        // Same token: no warning
        state.observe_fingerprint("flow:delivery", "token-1");
        assert!(state.warnings.is_empty());

        // Drift: warning recorded, original kept
        state.observe_fingerprint("flow:delivery", "token-2");
        assert_eq!(state.warnings.len(), 1);
        assert_eq!(state.warnings[0].code, "spec_drift");
        assert_eq!(
            state.fingerprints.get("flow:delivery").map(String::as_str),
            Some("token-1")
        );
    }

    #[test]
    fn test_injected_nodes_recorded() {
        let mut state = state();
        let node = crate::flow::test_support::node("adhoc", "worker");
        let inject = StackFrame {
            interrupted: StepRef::new("delivery", "b"),
            reason: "gap".to_string(),
            target: InjectionTarget::Nodes {
                nodes: vec![node.clone()],
            },
            pending: vec!["adhoc".to_string()],
            pushed_at: Utc::now(),
        };
        state.push_frame(inject, StepRef::new("delivery", "c"));
        assert_eq!(state.injected_nodes.len(), 1);
        assert_eq!(state.injected_nodes[0].id, "adhoc");
    }
}
