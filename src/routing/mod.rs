//! Routing engine: handoff result + run state → next routing decision.
//!
//! The decision vocabulary is closed. Handoff actions map onto graph
//! navigation (proceed advances, rerun repeats up to the retry ceiling,
//! bounce pops or switches to its target, fix-environment interrupts the
//! run), and detours/injections are explicit, policy-checked requests that
//! push interruption frames. Every push pairs with exactly one later pop;
//! the engine mutates the stacks, the orchestrator persists the result.

mod engine;

pub use engine::RoutingEngine;

use crate::flow::{Flow, FlowEdge, FlowNode, StepRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolves flow ids to documents. Implemented by the specification store;
/// tests use a plain map.
pub trait FlowResolver {
    fn resolve_flow(&self, id: &str) -> Option<Flow>;
}

impl FlowResolver for std::collections::HashMap<String, Flow> {
    fn resolve_flow(&self, id: &str) -> Option<Flow> {
        self.get(id).cloned()
    }
}

/// The outcome of one routing decision. The orchestrator executes it;
/// observers read it off the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteDecision {
    /// Advance to the next step along the graph
    Continue { to: StepRef },
    /// Re-dispatch the same step
    Rerun { step: StepRef, attempt: u32 },
    /// A detour/injection frame was pushed; next step is the injection's
    Injected { first: StepRef, classification: String },
    /// A frame was popped; the run resumes at the saved position
    Returned { resume_at: StepRef },
    /// Jump to a declared bounce target
    Bounce { to: StepRef, reason: String },
    /// Halt the run pending external remediation
    FixEnvironment { reason: String },
    /// A graph extension was proposed, never applied live
    Proposed { proposal: GraphExtension },
    /// The run reached a terminal step with an empty stack
    Complete,
}

/// A proposed patch to a flow graph, recorded for later authoring approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphExtension {
    pub id: Uuid,
    /// Flow the proposal targets
    pub flow: String,
    /// Why the extension is being proposed
    pub rationale: String,
    pub add_nodes: Vec<FlowNode>,
    pub add_edges: Vec<FlowEdge>,
    pub proposed_at: DateTime<Utc>,
    /// Run that motivated the proposal
    pub run_id: Uuid,
}

impl GraphExtension {
    pub fn new(flow: &str, rationale: &str, run_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow: flow.to_string(),
            rationale: rationale.to_string(),
            add_nodes: Vec::new(),
            add_edges: Vec::new(),
            proposed_at: Utc::now(),
            run_id,
        }
    }

    pub fn with_node(mut self, node: FlowNode) -> Self {
        self.add_nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: FlowEdge) -> Self {
        self.add_edges.push(edge);
        self
    }
}
