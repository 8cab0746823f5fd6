use serde_json::{json, Map, Value};
use tracing::info;

use trellis_core::error::Result;
use trellis_core::graph::{Graph, NodeSpec};

use super::{config_str_opt, merge, ExecContext, Outcome};
use crate::template::resolve_text;

const DEFAULT_MESSAGE: &str = "Do you want to continue with this workflow?";

/// user_approval: a two-phase gate.
///
/// First entry (no decision in the input) suspends the run with the resolved
/// message. The resume entry point re-enqueues the same node with
/// `approval_decision` present, and this second entry records the decision
/// and routes along the "yes"/"no" edge.
pub fn run(graph: &Graph, node: &NodeSpec, ctx: &ExecContext) -> Result<Outcome> {
    let message = resolve_text(
        config_str_opt(node, "message").unwrap_or(DEFAULT_MESSAGE),
        &ctx.input,
    );

    let Some(decision) = ctx.input.get("approval_decision").and_then(Value::as_str) else {
        info!(node_id = %node.id, "Approval gate reached, suspending run");
        return Ok(Outcome::Suspend { message });
    };

    let normalized = match decision.trim().to_lowercase().as_str() {
        "yes" | "approve" | "approved" | "true" => "yes",
        _ => "no",
    };
    info!(node_id = %node.id, decision = normalized, "Approval gate resumed");

    let approval_message = ctx
        .input
        .get("approval_message")
        .and_then(Value::as_str)
        .unwrap_or(&message)
        .to_string();

    let mut fields = Map::new();
    fields.insert("approval_decision".into(), json!(normalized));
    fields.insert("approval_message".into(), json!(approval_message));

    let next = graph.successors(&node.id, Some(normalized));
    Ok(Outcome::advance(merge(&ctx.input, fields), next))
}
