//! Flow graphs: versioned, directed graphs of station-backed steps.
//!
//! A flow is a pre-declared graph, not an arbitrary DAG: nodes reference
//! station templates, edges carry optional conditions, and a policy bounds
//! every looping or injecting behavior. Loops are edges, never recursive
//! calls; the adjacency structure is arena-indexed (node id → index).
//!
//! ## Components
//!
//! 1. **Types** (this module) - flow, node, edge and policy documents
//! 2. **Graph** - arena-indexed adjacency with reachability queries
//! 3. **Validate** - leveled validation producing stable findings

mod graph;
mod validate;

pub use graph::{FlowGraph, NodeIndex};
pub use validate::{
    Finding, Severity, ValidationLevel, validate_policy, validate_routing, validate_structural,
};

use crate::station::ResourceTier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A versioned flow graph document. Mutated only through the
/// concurrency-guarded specification store, never by a running orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Stable identifier (e.g. "feature-delivery")
    pub id: String,
    /// Version number; bumped on any change through the store
    pub version: u32,
    /// Human-readable name
    pub name: String,
    /// Node id of the entry step
    pub entry: String,
    /// Addressable steps, in authoring order
    pub nodes: Vec<FlowNode>,
    /// Directed edges between steps
    pub edges: Vec<FlowEdge>,
    /// Ceilings and allow-lists governing every run of this flow
    #[serde(default)]
    pub policy: FlowPolicy,
}

impl Flow {
    /// Identifier qualified with the version, e.g. `feature-delivery@v2`.
    pub fn versioned_id(&self) -> String {
        format!("{}@v{}", self.id, self.version)
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges leaving the given node, in declaration order.
    pub fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a FlowEdge> {
        self.edges.iter().filter(move |e| e.from == id)
    }
}

/// One step in a flow, referencing a pinned station version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    /// Step identifier, unique within the flow
    pub id: String,
    /// Station template this step executes as
    pub station: String,
    /// Pinned station version
    pub station_version: u32,
    /// Routing classification
    #[serde(default)]
    pub kind: NodeKind,
    /// Placeholder values overriding station defaults (step wins)
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Step-level engine narrowing; may never widen the station ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_overrides: Option<EngineOverrides>,
    /// Paired critic step for microloop nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critic: Option<String>,
}

/// Routing classification of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Advances along its default edge
    #[default]
    Linear,
    /// Loops to itself or a paired critic until verified or exhausted
    Microloop,
    /// Selects among conditional successor edges
    Branch,
    /// Run terminates (or the current frame pops) on completion
    Terminal,
}

/// Step-level engine narrowing. Only tier and capabilities may be
/// overridden, and only downward; the compiler rejects escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<ResourceTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

/// A directed edge between two steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: String,
    pub to: String,
    /// Condition gating this edge; `None` marks the default edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
}

impl FlowEdge {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
        }
    }

    pub fn when(from: &str, to: &str, condition: EdgeCondition) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            condition: Some(condition),
        }
    }

    /// Whether this is the unconditional default edge.
    pub fn is_default(&self) -> bool {
        self.condition.is_none()
    }
}

/// Edge condition, matched against the handoff status of the source step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    Verified,
    Unverified,
    Partial,
    Blocked,
}

/// Policy ceilings and allow-lists for a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPolicy {
    /// Consecutive reruns of one step before forced fix-environment
    pub retry_ceiling: u32,
    /// Microloop iterations before the declared exhaustion behavior fires
    pub microloop_ceiling: u32,
    /// Maximum nesting of injected flows/node sequences
    pub injection_depth_ceiling: u32,
    /// Per-dispatch wall-clock ceiling; falls back to the station profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
    /// Routing decisions this flow permits
    pub allowed_actions: Vec<RouteActionKind>,
    /// Advisory, pre-catalogued detour sequences
    #[serde(default)]
    pub detour_suggestions: Vec<DetourSuggestion>,
    /// What an exhausted microloop converts into
    #[serde(default)]
    pub on_microloop_exhausted: ExhaustionBehavior,
    /// Fallback target for a bounce that declares none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_bounce: Option<StepRef>,
}

impl Default for FlowPolicy {
    fn default() -> Self {
        Self {
            retry_ceiling: 2,
            microloop_ceiling: 5,
            injection_depth_ceiling: 3,
            step_timeout_secs: None,
            allowed_actions: vec![RouteActionKind::Continue, RouteActionKind::Detour],
            detour_suggestions: Vec::new(),
            on_microloop_exhausted: ExhaustionBehavior::default(),
            default_bounce: None,
        }
    }
}

impl FlowPolicy {
    pub fn allows(&self, action: RouteActionKind) -> bool {
        self.allowed_actions.contains(&action)
    }
}

/// Payload-free names of the closed routing vocabulary, used in policy
/// allow-lists. The decision type itself lives in the routing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteActionKind {
    Continue,
    Detour,
    InjectFlow,
    InjectNodes,
    ExtendGraph,
}

impl std::fmt::Display for RouteActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RouteActionKind::Continue => "continue",
            RouteActionKind::Detour => "detour",
            RouteActionKind::InjectFlow => "inject_flow",
            RouteActionKind::InjectNodes => "inject_nodes",
            RouteActionKind::ExtendGraph => "extend_graph",
        };
        f.write_str(s)
    }
}

/// Pre-catalogued detour: a short node sequence injected for a reason,
/// returning to the interrupted position afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetourSuggestion {
    /// Stable reason code the routing engine matches on
    pub reason: String,
    /// Node ids (within this flow) executed in order
    pub nodes: Vec<String>,
}

/// Behavior when a microloop exhausts its iteration ceiling. Declared per
/// flow; there is no authoritative global constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionBehavior {
    /// Convert the loop exit into a bounce to the declared target
    #[default]
    Bounce,
    /// Advance along the default edge, recording the unresolved concerns
    ProceedWithConcerns,
}

/// Fully qualified step position (flow + step).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepRef {
    pub flow: String,
    pub step: String,
}

impl StepRef {
    pub fn new(flow: &str, step: &str) -> Self {
        Self {
            flow: flow.to_string(),
            step: step.to_string(),
        }
    }
}

impl std::fmt::Display for StepRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.flow, self.step)
    }
}
