//! Arena-indexed adjacency for flow graphs.
//!
//! Nodes are addressed by index into the flow's node list; edges are index
//! pairs. Unlike a build-dependency DAG, flows may legitimately contain
//! loop edges (microloops, bounces) as long as every loop edge is a back
//! edge; validation enforces that, this module only answers reachability
//! questions.

use super::{EdgeCondition, Flow, FlowNode, NodeKind};
use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet, VecDeque};

/// Index into the flow's node list.
pub type NodeIndex = usize;

/// Adjacency view over one flow.
#[derive(Debug)]
pub struct FlowGraph {
    /// Node ids in arena order
    ids: Vec<String>,
    /// Map from node id to index
    index_map: HashMap<String, NodeIndex>,
    /// Outgoing edges: index -> (target, condition)
    outgoing: Vec<Vec<(NodeIndex, Option<EdgeCondition>)>>,
    /// Entry node index
    entry: NodeIndex,
    /// Node kinds in arena order
    kinds: Vec<NodeKind>,
}

impl FlowGraph {
    /// Build the adjacency structure for a flow.
    ///
    /// Fails on duplicate node ids, an unknown entry node, or an edge
    /// endpoint that does not exist. Looser invariants (missing successors,
    /// forward-only loops) are the validator's concern.
    pub fn new(flow: &Flow) -> Result<Self> {
        let mut index_map = HashMap::new();
        for (i, node) in flow.nodes.iter().enumerate() {
            if index_map.insert(node.id.clone(), i).is_some() {
                bail!("Duplicate node id '{}' in flow '{}'", node.id, flow.id);
            }
        }

        let Some(&entry) = index_map.get(&flow.entry) else {
            bail!(
                "Entry node '{}' does not exist in flow '{}'",
                flow.entry,
                flow.id
            );
        };

        let mut outgoing: Vec<Vec<(NodeIndex, Option<EdgeCondition>)>> =
            vec![Vec::new(); flow.nodes.len()];

        for edge in &flow.edges {
            let from = *index_map.get(&edge.from).ok_or_else(|| {
                anyhow::anyhow!("Edge source '{}' does not exist in flow '{}'", edge.from, flow.id)
            })?;
            let to = *index_map.get(&edge.to).ok_or_else(|| {
                anyhow::anyhow!("Edge target '{}' does not exist in flow '{}'", edge.to, flow.id)
            })?;
            outgoing[from].push((to, edge.condition));
        }

        Ok(Self {
            ids: flow.nodes.iter().map(|n| n.id.clone()).collect(),
            index_map,
            outgoing,
            entry,
            kinds: flow.nodes.iter().map(|n| n.kind).collect(),
        })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Index for a node id.
    pub fn index(&self, id: &str) -> Option<NodeIndex> {
        self.index_map.get(id).copied()
    }

    /// Node id at an index.
    pub fn id(&self, index: NodeIndex) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    /// Entry node index.
    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    /// Outgoing edges of a node.
    pub fn successors(&self, index: NodeIndex) -> &[(NodeIndex, Option<EdgeCondition>)] {
        self.outgoing.get(index).map_or(&[], |v| v.as_slice())
    }

    /// The unconditional default successor of a node, if any.
    pub fn default_successor(&self, id: &str) -> Option<&str> {
        let index = self.index(id)?;
        self.successors(index)
            .iter()
            .find(|(_, cond)| cond.is_none())
            .and_then(|(to, _)| self.id(*to))
    }

    /// The successor selected by a condition, falling back to the default
    /// edge when no conditional edge matches.
    pub fn successor_for(&self, id: &str, condition: EdgeCondition) -> Option<&str> {
        let index = self.index(id)?;
        self.successors(index)
            .iter()
            .find(|(_, cond)| *cond == Some(condition))
            .and_then(|(to, _)| self.id(*to))
            .or_else(|| self.default_successor(id))
    }

    /// Whether `to` can reach `from` by following edges, i.e. the edge
    /// `from -> to` closes a loop rather than jumping forward.
    pub fn is_back_edge(&self, from: NodeIndex, to: NodeIndex) -> bool {
        from == to || self.can_reach(to, from)
    }

    /// Breadth-first reachability between two nodes.
    pub fn can_reach(&self, from: NodeIndex, to: NodeIndex) -> bool {
        if from == to {
            return true;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            for &(next, _) in self.successors(node) {
                if next == to {
                    return true;
                }
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    /// All nodes reachable from the entry node (entry included).
    pub fn reachable_from_entry(&self) -> HashSet<NodeIndex> {
        let mut seen = HashSet::from([self.entry]);
        let mut queue = VecDeque::from([self.entry]);
        while let Some(node) = queue.pop_front() {
            for &(next, _) in self.successors(node) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Whether the node at an index is terminal.
    pub fn is_terminal(&self, index: NodeIndex) -> bool {
        self.kinds.get(index) == Some(&NodeKind::Terminal)
    }

    /// Convenience lookup of a node definition from the source flow.
    pub fn node<'a>(&self, flow: &'a Flow, id: &str) -> Option<&'a FlowNode> {
        flow.node(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::test_support::{linear_flow, node};
    use crate::flow::{FlowEdge, FlowPolicy};

    fn diamond() -> Flow {
        let mut d = node("d", "finisher");
        d.kind = NodeKind::Terminal;
        Flow {
            id: "diamond".to_string(),
            version: 1,
            name: "Diamond".to_string(),
            entry: "a".to_string(),
            nodes: vec![node("a", "w"), node("b", "w"), node("c", "w"), d],
            edges: vec![
                FlowEdge::when("a", "b", EdgeCondition::Verified),
                FlowEdge::new("a", "c"),
                FlowEdge::new("b", "d"),
                FlowEdge::new("c", "d"),
            ],
            policy: FlowPolicy::default(),
        }
    }

    #[test]
    fn test_build_and_lookup() {
        let flow = linear_flow("f");
        let graph = FlowGraph::new(&flow).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.entry(), 0);
        assert_eq!(graph.index("b"), Some(1));
        assert_eq!(graph.id(2), Some("c"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut flow = linear_flow("f");
        flow.nodes.push(node("a", "w"));
        let err = FlowGraph::new(&flow).unwrap_err().to_string();
        assert!(err.contains("Duplicate"));
    }

    #[test]
    fn test_unknown_edge_endpoint_rejected() {
        let mut flow = linear_flow("f");
        flow.edges.push(FlowEdge::new("c", "ghost"));
        let err = FlowGraph::new(&flow).unwrap_err().to_string();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn test_default_successor() {
        let flow = linear_flow("f");
        let graph = FlowGraph::new(&flow).unwrap();
        assert_eq!(graph.default_successor("a"), Some("b"));
        assert_eq!(graph.default_successor("c"), None);
    }

    #[test]
    fn test_conditional_successor_with_fallback() {
        let flow = diamond();
        let graph = FlowGraph::new(&flow).unwrap();
        assert_eq!(graph.successor_for("a", EdgeCondition::Verified), Some("b"));
        // No partial edge declared, falls back to the default edge
        assert_eq!(graph.successor_for("a", EdgeCondition::Partial), Some("c"));
    }

    #[test]
    fn test_reachability() {
        let flow = diamond();
        let graph = FlowGraph::new(&flow).unwrap();
        assert!(graph.can_reach(0, 3));
        assert!(!graph.can_reach(3, 0));
        assert_eq!(graph.reachable_from_entry().len(), 4);
    }

    #[test]
    fn test_back_edge_detection() {
        let mut flow = linear_flow("f");
        // b -> a closes a loop; a -> c would jump forward
        flow.edges.push(FlowEdge::new("b", "a"));
        let graph = FlowGraph::new(&flow).unwrap();
        let (a, b, c) = (0, 1, 2);
        assert!(graph.is_back_edge(b, a));
        assert!(graph.is_back_edge(b, b));
        assert!(!graph.is_back_edge(a, c));
    }

    #[test]
    fn test_terminal_kind() {
        let flow = linear_flow("f");
        let graph = FlowGraph::new(&flow).unwrap();
        assert!(!graph.is_terminal(0));
        assert!(graph.is_terminal(2));
    }
}
