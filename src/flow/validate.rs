//! Leveled flow validation producing stable, machine-readable findings.
//!
//! Levels strictly include one another: `structural` checks required fields
//! and shape, `referential` resolves station/fragment references (run by the
//! specification store, which owns the catalogs), `routing` checks successor
//! liveness and loop-edge direction, `full` adds cross-graph constraints.
//! Validation never mutates; it returns findings with a stable code, a
//! severity, a path into the document and, where derivable, a suggestion.

use super::{Flow, FlowGraph, NodeKind, RouteActionKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How deep validation goes. Each level runs everything below it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Required fields present, shapes correct
    Structural,
    /// Every station/fragment reference resolves
    Referential,
    /// Successor liveness and loop-edge direction
    #[default]
    Routing,
    /// Cross-graph constraints (singletons, membership, policy consistency)
    Full,
}

/// Severity of a finding.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    #[default]
    Warning,
}

impl Severity {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable machine code, e.g. `flow.node.missing_successor`
    pub code: String,
    pub severity: Severity,
    /// Path into the document, e.g. `nodes/b`
    pub path: String,
    /// Human-readable explanation
    pub message: String,
    /// Suggested correction, where one is derivable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Finding {
    pub fn error(code: &str, path: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Error,
            path: path.to_string(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn warning(code: &str, path: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Warning,
            path: path.to_string(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {} at {}: {}", self.severity, self.code, self.path, self.message)
    }
}

/// Structural validation: required fields, uniqueness, edge endpoints.
pub fn validate_structural(flow: &Flow) -> Vec<Finding> {
    let mut findings = Vec::new();

    if flow.id.is_empty() {
        findings.push(Finding::error("flow.id.empty", "id", "Flow id must not be empty"));
    }
    if flow.nodes.is_empty() {
        findings.push(Finding::error(
            "flow.nodes.empty",
            "nodes",
            "Flow declares no nodes",
        ));
        return findings;
    }

    let mut seen = std::collections::HashSet::new();
    for node in &flow.nodes {
        let path = format!("nodes/{}", node.id);
        if node.id.is_empty() {
            findings.push(Finding::error("flow.node.empty_id", "nodes", "Node with empty id"));
        }
        if !seen.insert(node.id.as_str()) {
            findings.push(Finding::error(
                "flow.node.duplicate_id",
                &path,
                format!("Node id '{}' declared more than once", node.id),
            ));
        }
        if node.station.is_empty() {
            findings.push(
                Finding::error(
                    "flow.node.missing_station",
                    &path,
                    format!("Node '{}' references no station", node.id),
                )
                .with_suggestion("Set `station` to a catalogued station id"),
            );
        }
        if node.kind == NodeKind::Microloop && node.critic.is_none() {
            findings.push(Finding::warning(
                "flow.node.microloop_without_critic",
                &path,
                format!("Microloop node '{}' pairs with no critic step", node.id),
            ));
        }
    }

    if flow.node(&flow.entry).is_none() {
        findings.push(
            Finding::error(
                "flow.entry.unknown",
                "entry",
                format!("Entry node '{}' does not exist", flow.entry),
            )
            .with_suggestion("Point `entry` at a declared node id"),
        );
    }

    for (i, edge) in flow.edges.iter().enumerate() {
        let path = format!("edges/{i}");
        if flow.node(&edge.from).is_none() {
            findings.push(Finding::error(
                "flow.edge.unknown_source",
                &path,
                format!("Edge source '{}' does not exist", edge.from),
            ));
        }
        if flow.node(&edge.to).is_none() {
            findings.push(Finding::error(
                "flow.edge.unknown_target",
                &path,
                format!("Edge target '{}' does not exist", edge.to),
            ));
        }
    }

    if let Some(critic) = flow
        .nodes
        .iter()
        .filter_map(|n| n.critic.as_deref().map(|c| (n.id.as_str(), c)))
        .find(|(_, c)| flow.node(c).is_none())
    {
        findings.push(Finding::error(
            "flow.node.unknown_critic",
            &format!("nodes/{}", critic.0),
            format!("Critic step '{}' does not exist", critic.1),
        ));
    }

    findings
}

/// Routing validation: successor liveness, reachability, loop direction.
///
/// Assumes structural validation passed; on a structurally broken flow the
/// findings degrade to a single `flow.graph.unbuildable` error.
pub fn validate_routing(flow: &Flow) -> Vec<Finding> {
    let graph = match FlowGraph::new(flow) {
        Ok(g) => g,
        Err(e) => {
            return vec![Finding::error(
                "flow.graph.unbuildable",
                "nodes",
                e.to_string(),
            )];
        }
    };

    let mut findings = Vec::new();
    let reachable = graph.reachable_from_entry();

    for (i, node) in flow.nodes.iter().enumerate() {
        let path = format!("nodes/{}", node.id);

        if node.kind != NodeKind::Terminal && graph.successors(i).is_empty() {
            findings.push(
                Finding::error(
                    "flow.node.missing_successor",
                    &path,
                    format!("Non-terminal node '{}' has no successor edge", node.id),
                )
                .with_suggestion(format!(
                    "Add an edge from '{}' or mark it terminal",
                    node.id
                )),
            );
        }

        if !reachable.contains(&i) {
            findings.push(Finding::error(
                "flow.node.unreachable",
                &path,
                format!("Node '{}' is unreachable from entry '{}'", node.id, flow.entry),
            ));
        }

        if node.kind == NodeKind::Terminal && !graph.successors(i).is_empty() {
            findings.push(Finding::warning(
                "flow.node.terminal_with_successor",
                &path,
                format!("Terminal node '{}' declares outgoing edges", node.id),
            ));
        }
    }

    // A cycle-closing edge must leave from a node that can also exit the
    // loop; a linear source would cycle unconditionally forever.
    for (i, edge) in flow.edges.iter().enumerate() {
        let (Some(from), Some(to)) = (graph.index(&edge.from), graph.index(&edge.to)) else {
            continue;
        };
        if !graph.is_back_edge(from, to) {
            continue;
        }
        let source_kind = flow.node(&edge.from).map(|n| n.kind);
        if !matches!(source_kind, Some(NodeKind::Branch) | Some(NodeKind::Microloop)) {
            findings.push(
                Finding::error(
                    "flow.edge.unexitable_loop",
                    &format!("edges/{i}"),
                    format!(
                        "Loop edge '{}' -> '{}' leaves a linear node, which can never exit the loop",
                        edge.from, edge.to
                    ),
                )
                .with_suggestion(format!(
                    "Mark '{}' as a branch or microloop node",
                    edge.from
                )),
            );
        }
    }

    findings
}

/// Policy-consistency checks that need only the flow itself. The store runs
/// these as part of `full` validation alongside its cross-graph checks.
pub fn validate_policy(flow: &Flow) -> Vec<Finding> {
    let mut findings = Vec::new();
    let policy = &flow.policy;

    if !policy.detour_suggestions.is_empty() && !policy.allows(RouteActionKind::Detour) {
        findings.push(
            Finding::error(
                "flow.policy.detour_not_allowed",
                "policy/detour_suggestions",
                "Detour suggestions declared but 'detour' is not in the action allow-list",
            )
            .with_suggestion("Add 'detour' to policy.allowed_actions"),
        );
    }

    for (i, suggestion) in policy.detour_suggestions.iter().enumerate() {
        for node_id in &suggestion.nodes {
            if flow.node(node_id).is_none() {
                findings.push(Finding::error(
                    "flow.policy.unknown_detour_node",
                    &format!("policy/detour_suggestions/{i}"),
                    format!("Detour '{}' references unknown node '{}'", suggestion.reason, node_id),
                ));
            }
        }
    }

    if policy.allows(RouteActionKind::InjectFlow) && policy.injection_depth_ceiling == 0 {
        findings.push(Finding::error(
            "flow.policy.zero_injection_depth",
            "policy/injection_depth_ceiling",
            "inject_flow is allowed but the injection depth ceiling is zero",
        ));
    }

    if let Some(target) = &policy.default_bounce
        && target.flow == flow.id
        && flow.node(&target.step).is_none()
    {
        findings.push(Finding::error(
            "flow.policy.unknown_bounce_target",
            "policy/default_bounce",
            format!("Default bounce step '{}' does not exist", target.step),
        ));
    }

    findings
}
