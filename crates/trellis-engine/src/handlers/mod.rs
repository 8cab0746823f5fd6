//! Node handlers: one pure-ish function per node type over
//! `(NodeSpec, context)` returning the produced output and successor ids.
//!
//! Every handler obeys the accumulation rule: its output is the input merged
//! with the fields it produced (shallow, last writer wins), so downstream
//! nodes see everything upstream ever emitted.

pub mod agent;
pub mod approval;
pub mod cognitive;
pub mod condition;
pub mod guardrails;
pub mod passthrough;

use std::sync::Arc;

use serde_json::{Map, Value};

use trellis_core::config::AppConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::graph::{Graph, NodeSpec, NodeType};
use trellis_core::traits::{ChatClient, ToolInvoker, WorkflowStore};
use trellis_core::types::RunId;

/// Execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub workflow_id: String,
    pub run_id: RunId,
    pub node_id: String,
    pub input: Value,
}

/// What a handler decided.
#[derive(Debug)]
pub enum Outcome {
    /// Normal completion: merged output plus successor node ids.
    Advance {
        output: Value,
        next: Vec<String>,
        /// Recorded tool/traversal activity for the ledger row.
        tool_calls: Option<Value>,
    },
    /// Suspend the run at a human-approval gate.
    Suspend { message: String },
}

impl Outcome {
    pub fn advance(output: Value, next: Vec<String>) -> Self {
        Self::Advance {
            output,
            next,
            tool_calls: None,
        }
    }
}

/// Shared collaborators for handlers.
#[derive(Clone)]
pub struct HandlerDeps {
    pub store: Arc<dyn WorkflowStore>,
    pub llm: Arc<dyn ChatClient>,
    pub tools: Arc<dyn ToolInvoker>,
    pub config: AppConfig,
}

/// Dispatch a node to its handler.
pub async fn dispatch(
    graph: &Graph,
    node: &NodeSpec,
    ctx: &ExecContext,
    deps: &HandlerDeps,
) -> Result<Outcome> {
    match node.node_type {
        NodeType::Start | NodeType::End | NodeType::Fork => {
            passthrough::run(graph, node, ctx)
        }
        NodeType::IfElse => condition::run(graph, node, ctx),
        NodeType::Agent => agent::run(graph, node, ctx, deps).await,
        NodeType::Guardrails => guardrails::run(graph, node, ctx, deps).await,
        NodeType::UserApproval => approval::run(graph, node, ctx),
        NodeType::Cognitive => cognitive::run(graph, node, ctx, deps).await,
    }
}

/// Shallow right-biased merge: the accumulation rule of the whole engine.
pub fn merge(input: &Value, fields: Map<String, Value>) -> Value {
    let mut base = match input {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    base.extend(fields);
    Value::Object(base)
}

/// Required string config field.
pub(crate) fn config_str<'a>(node: &'a NodeSpec, key: &str) -> Result<&'a str> {
    node.config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| TrellisError::NodeConfig {
            node: node.id.clone(),
            message: format!("missing required string field \"{}\"", key),
        })
}

/// Optional string config field.
pub(crate) fn config_str_opt<'a>(node: &'a NodeSpec, key: &str) -> Option<&'a str> {
    node.config.get(key).and_then(Value::as_str)
}

pub(crate) fn config_bool(node: &NodeSpec, key: &str) -> bool {
    node.config.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Parse an LLM response that may wrap JSON in markdown code fences.
pub(crate) fn parse_json_block(content: &str) -> Result<Value> {
    let mut text = content.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    let text = text.trim();
    serde_json::from_str(text)
        .map_err(|e| TrellisError::LlmParse(format!("{}; content: {}", e, truncate(content, 200))))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_right_biased() {
        let input = json!({"a": 1, "b": "old"});
        let mut fields = Map::new();
        fields.insert("b".into(), json!("new"));
        fields.insert("c".into(), json!(3));

        let merged = merge(&input, fields);
        assert_eq!(merged, json!({"a": 1, "b": "new", "c": 3}));
    }

    #[test]
    fn merge_with_non_object_input_keeps_fields() {
        let mut fields = Map::new();
        fields.insert("x".into(), json!(1));
        assert_eq!(merge(&json!(null), fields), json!({"x": 1}));
    }

    #[test]
    fn parse_json_block_strips_fences() {
        let value = parse_json_block("```json\n{\"pass\": true}\n```").expect("parse");
        assert_eq!(value, json!({"pass": true}));

        let value = parse_json_block("```\n{\"a\": 1}\n```").expect("parse");
        assert_eq!(value, json!({"a": 1}));

        let value = parse_json_block("{\"plain\": true}").expect("parse");
        assert_eq!(value, json!({"plain": true}));
    }

    #[test]
    fn parse_json_block_rejects_garbage() {
        assert!(parse_json_block("not json at all").is_err());
    }
}
