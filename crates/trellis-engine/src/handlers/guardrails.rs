use serde_json::{json, Map, Value};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::graph::{Graph, NodeSpec};
use trellis_core::types::ChatMessage;

use super::{config_str, merge, parse_json_block, ExecContext, HandlerDeps, Outcome};
use crate::template::resolve_text;

const GUARDRAIL_SYSTEM_PROMPT: &str = r#"You are a professional guardrail engineer. You are given a guardrail and a user prompt. You need to check if the user prompt satisfies the guardrail.

Output format (**ONLY JSON**):
```json
{
    "pass": true,
    "reason": "Reason for guardrail pass or fail"
}
```"#;

/// guardrails: an LLM judges whether the context satisfies the policy text
/// and routing follows the "pass"/"fail" edge.
pub async fn run(
    graph: &Graph,
    node: &NodeSpec,
    ctx: &ExecContext,
    deps: &HandlerDeps,
) -> Result<Outcome> {
    let guardrail = config_str(node, "guardrail")?;
    let user_prompt = resolve_text(guardrail, &ctx.input);

    let response = deps
        .llm
        .chat(
            &deps.config.model.default_model,
            vec![
                ChatMessage::system(GUARDRAIL_SYSTEM_PROMPT),
                ChatMessage::user(user_prompt),
            ],
            &[],
        )
        .await?;

    let verdict = parse_json_block(&response.content)?;
    let pass = verdict
        .get("pass")
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            TrellisError::LlmParse("guardrail verdict missing boolean \"pass\"".into())
        })?;
    let reason = verdict
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    debug!(node_id = %node.id, pass, "Guardrail verdict");

    let mut fields = Map::new();
    fields.insert("guardrail_pass".into(), json!(pass));
    fields.insert("guardrail_reason".into(), json!(reason));

    let branch = if pass { "pass" } else { "fail" };
    let next = graph.successors(&node.id, Some(branch));

    Ok(Outcome::advance(merge(&ctx.input, fields), next))
}
