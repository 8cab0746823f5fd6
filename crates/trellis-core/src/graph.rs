use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TrellisError};

/// Node types the engine can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Agent,
    IfElse,
    Guardrails,
    Fork,
    UserApproval,
    Cognitive,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Agent => "agent",
            Self::IfElse => "if_else",
            Self::Guardrails => "guardrails",
            Self::Fork => "fork",
            Self::UserApproval => "user_approval",
            Self::Cognitive => "cognitive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "end" => Some(Self::End),
            "agent" => Some(Self::Agent),
            "if_else" => Some(Self::IfElse),
            "guardrails" => Some(Self::Guardrails),
            "fork" => Some(Self::Fork),
            "user_approval" => Some(Self::UserApproval),
            "cognitive" => Some(Self::Cognitive),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed node in a workflow graph.
///
/// `config` is an opaque JSON object whose expected shape varies by type;
/// handlers validate the fields they need at entry. `position` is editor
/// state the engine never reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            config: Value::Object(serde_json::Map::new()),
            position: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A directed labeled edge.
///
/// `source_handle` carries the branch label ("true"/"false", "pass"/"fail",
/// "yes"/"no"). Absence means the default branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "source_node")]
    pub source: String,
    #[serde(alias = "target_node")]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl EdgeSpec {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// A non-fatal finding from save-time validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphWarning {
    pub node_id: String,
    pub message: String,
}

impl std::fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.node_id, self.message)
    }
}

/// A workflow graph snapshot: typed nodes plus labeled edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

impl Graph {
    pub fn new(nodes: Vec<NodeSpec>, edges: Vec<EdgeSpec>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Start)
    }

    /// Successor node ids for `node_id`, filtered by branch outcome.
    ///
    /// With `outcome = None` every outgoing edge is followed regardless of
    /// handle. With an outcome, only edges whose normalized handle matches
    /// are followed. Duplicates are removed preserving order.
    pub fn successors(&self, node_id: &str, outcome: Option<&str>) -> Vec<String> {
        let norm = outcome.map(|o| o.trim().to_lowercase());
        let mut seen = HashSet::new();
        let mut next = Vec::new();
        for edge in self.edges.iter().filter(|e| e.source == node_id) {
            let handle = edge.source_handle.as_deref().map(|h| h.trim().to_lowercase());
            let matches = match &norm {
                None => true,
                Some(want) => handle.as_deref() == Some(want.as_str()),
            };
            if matches && seen.insert(edge.target.clone()) {
                next.push(edge.target.clone());
            }
        }
        next
    }

    /// Whether the graph contains a directed cycle.
    pub fn has_cycle(&self) -> bool {
        let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adj.entry(edge.source.as_str()).or_default().push(edge.target.as_str());
        }

        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();

        fn visit<'a>(
            node: &'a str,
            adj: &HashMap<&'a str, Vec<&'a str>>,
            visited: &mut HashSet<&'a str>,
            in_stack: &mut HashSet<&'a str>,
        ) -> bool {
            visited.insert(node);
            in_stack.insert(node);
            for next in adj.get(node).into_iter().flatten().copied() {
                if !visited.contains(next) {
                    if visit(next, adj, visited, in_stack) {
                        return true;
                    }
                } else if in_stack.contains(next) {
                    return true;
                }
            }
            in_stack.remove(node);
            false
        }

        for node in &self.nodes {
            if !visited.contains(node.id.as_str())
                && visit(node.id.as_str(), &adj, &mut visited, &mut in_stack)
            {
                return true;
            }
        }
        false
    }

    /// Node ids with no incoming edges.
    pub fn entry_nodes(&self) -> Vec<&NodeSpec> {
        let targets: HashSet<&str> = self.edges.iter().map(|e| e.target.as_str()).collect();
        self.nodes.iter().filter(|n| !targets.contains(n.id.as_str())).collect()
    }

    /// Node ids with no outgoing edges.
    pub fn terminal_nodes(&self) -> Vec<&NodeSpec> {
        let sources: HashSet<&str> = self.edges.iter().map(|e| e.source.as_str()).collect();
        self.nodes.iter().filter(|n| !sources.contains(n.id.as_str())).collect()
    }

    /// Save-time validation.
    ///
    /// Errors: cycles, missing/duplicate start, no end node, edges that
    /// reference unknown nodes, nodes unreachable from start.
    /// Warnings: if_else nodes missing a "true" or "false" branch (a missing
    /// branch is a legal terminal path).
    pub fn validate(&self) -> Result<Vec<GraphWarning>> {
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        if ids.len() != self.nodes.len() {
            return Err(TrellisError::Validation("duplicate node ids".into()));
        }

        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) {
                return Err(TrellisError::Validation(format!(
                    "edge references unknown source node: {}",
                    edge.source
                )));
            }
            if !ids.contains(edge.target.as_str()) {
                return Err(TrellisError::Validation(format!(
                    "edge references unknown target node: {}",
                    edge.target
                )));
            }
        }

        let starts: Vec<&NodeSpec> = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .collect();
        if starts.is_empty() {
            return Err(TrellisError::Validation("workflow has no start node".into()));
        }
        if starts.len() > 1 {
            return Err(TrellisError::Validation(format!(
                "workflow has {} start nodes, expected exactly one",
                starts.len()
            )));
        }
        if !self.nodes.iter().any(|n| n.node_type == NodeType::End) {
            return Err(TrellisError::Validation("workflow has no end node".into()));
        }

        if self.has_cycle() {
            return Err(TrellisError::Validation("workflow contains a cycle".into()));
        }

        // Reachability from start over all edges (handles ignored)
        let mut reachable = HashSet::new();
        let mut stack = vec![starts[0].id.as_str()];
        while let Some(node) = stack.pop() {
            if !reachable.insert(node) {
                continue;
            }
            for edge in self.edges.iter().filter(|e| e.source == node) {
                stack.push(edge.target.as_str());
            }
        }
        for node in &self.nodes {
            if !reachable.contains(node.id.as_str()) {
                return Err(TrellisError::Validation(format!(
                    "node {} is unreachable from start",
                    node.id
                )));
            }
        }

        let mut warnings = Vec::new();
        for node in self.nodes.iter().filter(|n| n.node_type == NodeType::IfElse) {
            for branch in ["true", "false"] {
                if self.successors(&node.id, Some(branch)).is_empty() {
                    warnings.push(GraphWarning {
                        node_id: node.id.clone(),
                        message: format!("if_else has no \"{}\" branch; that path terminates", branch),
                    });
                }
            }
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear_graph() -> Graph {
        Graph::new(
            vec![
                NodeSpec::new("a", NodeType::Start),
                NodeSpec::new("b", NodeType::Agent),
                NodeSpec::new("c", NodeType::End),
            ],
            vec![EdgeSpec::new("a", "b"), EdgeSpec::new("b", "c")],
        )
    }

    #[test]
    fn successors_unfiltered() {
        let graph = linear_graph();
        assert_eq!(graph.successors("a", None), vec!["b".to_string()]);
        assert!(graph.successors("c", None).is_empty());
    }

    #[test]
    fn successors_filtered_by_handle() {
        let graph = Graph::new(
            vec![
                NodeSpec::new("s", NodeType::Start),
                NodeSpec::new("cond", NodeType::IfElse),
                NodeSpec::new("t", NodeType::End),
                NodeSpec::new("f", NodeType::End),
            ],
            vec![
                EdgeSpec::new("s", "cond"),
                EdgeSpec::new("cond", "t").with_handle("true"),
                EdgeSpec::new("cond", "f").with_handle("False"),
            ],
        );
        assert_eq!(graph.successors("cond", Some("true")), vec!["t".to_string()]);
        // Handle matching is case-insensitive
        assert_eq!(graph.successors("cond", Some("false")), vec!["f".to_string()]);
        // An unlabeled outcome filter does not follow labeled edges
        assert!(graph.successors("cond", Some("maybe")).is_empty());
    }

    #[test]
    fn successors_dedup_preserving_order() {
        let graph = Graph::new(
            vec![
                NodeSpec::new("s", NodeType::Start),
                NodeSpec::new("x", NodeType::End),
                NodeSpec::new("y", NodeType::End),
            ],
            vec![
                EdgeSpec::new("s", "x"),
                EdgeSpec::new("s", "y"),
                EdgeSpec::new("s", "x"),
            ],
        );
        assert_eq!(graph.successors("s", None), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn validate_accepts_linear() {
        let graph = linear_graph();
        let warnings = graph.validate().expect("valid graph");
        assert!(warnings.is_empty());
    }

    #[test]
    fn validate_rejects_cycle() {
        let graph = Graph::new(
            vec![
                NodeSpec::new("s", NodeType::Start),
                NodeSpec::new("a", NodeType::Agent),
                NodeSpec::new("b", NodeType::Agent),
                NodeSpec::new("e", NodeType::End),
            ],
            vec![
                EdgeSpec::new("s", "a"),
                EdgeSpec::new("a", "b"),
                EdgeSpec::new("b", "a"),
                EdgeSpec::new("b", "e"),
            ],
        );
        assert!(graph.validate().is_err());
        assert!(graph.has_cycle());
    }

    #[test]
    fn validate_rejects_missing_start() {
        let graph = Graph::new(
            vec![NodeSpec::new("e", NodeType::End)],
            vec![],
        );
        assert!(graph.validate().is_err());
    }

    #[test]
    fn validate_rejects_dangling_edge() {
        let mut graph = linear_graph();
        graph.edges.push(EdgeSpec::new("b", "ghost"));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn validate_rejects_unreachable() {
        let mut graph = linear_graph();
        graph.nodes.push(NodeSpec::new("island", NodeType::Agent));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn validate_warns_on_missing_branch() {
        let graph = Graph::new(
            vec![
                NodeSpec::new("s", NodeType::Start),
                NodeSpec::new("cond", NodeType::IfElse)
                    .with_config(json!({"lhs": "1", "condition": ">", "rhs": "0"})),
                NodeSpec::new("t", NodeType::End),
            ],
            vec![
                EdgeSpec::new("s", "cond"),
                EdgeSpec::new("cond", "t").with_handle("true"),
            ],
        );
        let warnings = graph.validate().expect("warnings are not errors");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].node_id, "cond");
    }

    #[test]
    fn entry_and_terminal_nodes() {
        let graph = linear_graph();
        let entries = graph.entry_nodes();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "a");
        let terminals = graph.terminal_nodes();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].id, "c");
    }
}
