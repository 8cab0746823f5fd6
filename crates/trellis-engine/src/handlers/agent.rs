use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::graph::{Graph, NodeSpec};
use trellis_core::types::{ChatMessage, ToolSpec};

use super::{
    config_bool, config_str_opt, merge, parse_json_block, ExecContext, HandlerDeps, Outcome,
};
use crate::template::resolve_text;

/// agent: one LLM conversation with optional tool access.
///
/// The LLM is re-invoked while it keeps requesting tool calls, up to the
/// configured round budget; exceeding it fails the node. With
/// `structured_output` set, the final response must parse as JSON.
pub async fn run(
    graph: &Graph,
    node: &NodeSpec,
    ctx: &ExecContext,
    deps: &HandlerDeps,
) -> Result<Outcome> {
    let model = config_str_opt(node, "llm_model")
        .unwrap_or(&deps.config.model.default_model)
        .to_string();
    let mut system_prompt =
        resolve_text(config_str_opt(node, "system_prompt").unwrap_or(""), &ctx.input);
    let user_prompt =
        resolve_text(config_str_opt(node, "user_prompt").unwrap_or(""), &ctx.input);

    let structured = config_bool(node, "structured_output");
    let schema = config_str_opt(node, "structured_output_schema").unwrap_or("");
    if structured && !schema.is_empty() {
        system_prompt.push_str(&format!(
            "\n\nOutput format (**ONLY JSON**):\n```json\n{}\n```",
            schema
        ));
    }

    // Load the tools this node exposes to the LLM
    let tool_ids: Vec<String> = node
        .config
        .get("tools")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut specs: Vec<ToolSpec> = Vec::with_capacity(tool_ids.len());
    for tool_id in &tool_ids {
        let spec = deps
            .store
            .tool(tool_id)?
            .ok_or_else(|| TrellisError::ToolNotFound(tool_id.clone()))?;
        specs.push(spec);
    }
    let definitions = trellis_tools::tool_definitions(&specs);

    let mut messages = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_prompt),
    ];
    let mut recorded: Vec<Value> = Vec::new();
    let mut final_text: Option<String> = None;

    for round in 0..deps.config.engine.max_tool_rounds {
        let response = deps.llm.chat(&model, messages.clone(), &definitions).await?;

        if response.tool_calls.is_empty() {
            final_text = Some(response.content);
            break;
        }

        debug!(
            node_id = %node.id,
            round,
            calls = response.tool_calls.len(),
            "Agent requested tool calls"
        );

        messages.push(ChatMessage::assistant(
            response.content.clone(),
            response.tool_calls.clone(),
        ));

        for call in &response.tool_calls {
            let result = match specs.iter().find(|s| s.name == call.name) {
                Some(spec) => match deps.tools.invoke(spec, call.arguments.clone()).await {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Tool invocation failed");
                        Value::String(format!("Error executing tool: {}", e))
                    }
                },
                None => Value::String(format!("Error: Tool {} not found", call.name)),
            };

            recorded.push(json!({
                "id": call.id,
                "name": call.name,
                "arguments": call.arguments,
                "result": result,
            }));

            let content = match &result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            messages.push(ChatMessage::tool_result(call.id.clone(), content));
        }
    }

    let Some(final_text) = final_text else {
        return Err(TrellisError::ToolCallLimit);
    };

    let mut fields = Map::new();
    fields.insert("message".into(), json!(final_text));
    fields.insert("tool_calls".into(), Value::Array(recorded.clone()));
    if structured {
        let parsed = parse_json_block(&final_text)?;
        fields.insert("structured".into(), parsed);
    }

    let tool_calls_record = if recorded.is_empty() {
        None
    } else {
        Some(Value::Array(recorded))
    };

    Ok(Outcome::Advance {
        output: merge(&ctx.input, fields),
        next: graph.successors(&node.id, None),
        tool_calls: tool_calls_record,
    })
}
