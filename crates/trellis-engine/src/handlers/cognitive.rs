use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use trellis_core::error::{Result, TrellisError};
use trellis_core::graph::{EdgeSpec, Graph, NodeSpec, NodeType};
use trellis_core::types::ChatMessage;

use super::{agent, condition, config_str, guardrails, merge, parse_json_block};
use super::{ExecContext, HandlerDeps, Outcome};
use crate::template::resolve_text;

const COGNITIVE_SYSTEM_PROMPT: &str = r#"# Role
You are a professional workflow manager. Your job is to assemble a directed graph (nodes + edges) that executes a coherent flow.

# Objective
Given an instruction and the available input data, produce a valid workflow JSON with instantiated nodes (new UUIDv4 ids) and edges that define execution order and branching. The last node's response is the output of the workflow.

# Node Types & Schemas (exact keys)

## Agent Node
{
  "type": "agent",
  "llm_model": "<model id or omit for the default>",
  "system_prompt": "<system prompt>",
  "user_prompt": "<user prompt>",
  "structured_output": false,
  "structured_output_schema": ""
}
Source handles: none

## Guardrails
{
  "type": "guardrails",
  "guardrail": "<check to perform>"
}
Source handles: "pass", "fail"

## If/Else
{
  "type": "if_else",
  "lhs": "<string>",
  "rhs": "<string>",
  "condition": "<= | >= | < | > | = | !="
}
Source handles: "true", "false"

# Rules
- Guardrails: both "pass" and "fail" must be wired.
- If/Else: both "true" and "false" must be wired.
- The graph must be acyclic with exactly one entry node.
- Use {{input.FIELD}} templates to reference the input data.

# Output Format (strict)
Return ONLY:
{
  "nodes": [
    { "id": "<uuid-v4>", "data": { ...node schema... } }
  ],
  "edges": [
    { "source": "<uuid-v4>", "target": "<uuid-v4>", "source_handle": "<handle or null>", "target_handle": null }
  ],
  "reasoning": "<reasoning for the workflow decision>"
}"#;

#[derive(Deserialize)]
struct VirtualGraphWire {
    nodes: Vec<VirtualNodeWire>,
    edges: Vec<EdgeSpec>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct VirtualNodeWire {
    id: String,
    data: Map<String, Value>,
}

/// cognitive: an LLM synthesizes a small virtual workflow which is then
/// executed inline, inside this single node's ledger entry.
pub async fn run(
    graph: &Graph,
    node: &NodeSpec,
    ctx: &ExecContext,
    deps: &HandlerDeps,
) -> Result<Outcome> {
    let instruction = resolve_text(config_str(node, "cognitive_instruction")?, &ctx.input);

    let input_json = serde_json::to_string_pretty(&ctx.input)?;
    let user_prompt = format!(
        "Instruction: {}\n\nInput data available:\n```json\n{}\n```\n\nGenerate a workflow to accomplish this task.",
        instruction, input_json
    );

    info!(node_id = %node.id, "Generating virtual workflow");
    let response = deps
        .llm
        .chat(
            &deps.config.model.default_model,
            vec![
                ChatMessage::system(COGNITIVE_SYSTEM_PROMPT),
                ChatMessage::user(user_prompt),
            ],
            &[],
        )
        .await?;

    let wire: VirtualGraphWire = serde_json::from_value(parse_json_block(&response.content)?)
        .map_err(|e| TrellisError::LlmParse(format!("virtual workflow shape: {}", e)))?;

    let virtual_graph = build_virtual_graph(wire.nodes, wire.edges)?;
    validate_virtual_graph(&virtual_graph, deps.config.engine.max_virtual_nodes)?;

    debug!(
        nodes = virtual_graph.nodes.len(),
        edges = virtual_graph.edges.len(),
        "Virtual workflow validated"
    );

    let (final_output, trace) = walk_virtual_graph(&virtual_graph, ctx, deps).await?;

    let mut fields = Map::new();
    fields.insert("cognitive_output".into(), final_output);
    fields.insert("cognitive_reasoning".into(), json!(wire.reasoning));

    let record = json!({
        "virtual_workflow": {
            "node_count": virtual_graph.nodes.len(),
            "edge_count": virtual_graph.edges.len(),
            "nodes": virtual_graph.nodes,
            "edges": virtual_graph.edges,
        },
        "trace": trace,
    });

    Ok(Outcome::Advance {
        output: merge(&ctx.input, fields),
        next: graph.successors(&node.id, None),
        tool_calls: Some(record),
    })
}

/// Convert the LLM wire shape ({id, data: {type, ...}}) into engine nodes.
fn build_virtual_graph(nodes: Vec<VirtualNodeWire>, edges: Vec<EdgeSpec>) -> Result<Graph> {
    let mut specs = Vec::with_capacity(nodes.len());
    for wire in nodes {
        let type_str = wire
            .data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TrellisError::Validation(format!("virtual node {} missing type", wire.id))
            })?;
        let node_type = NodeType::parse(type_str)
            .ok_or_else(|| TrellisError::UnknownNodeType(type_str.to_string()))?;

        let mut config = wire.data.clone();
        config.remove("type");
        specs.push(NodeSpec {
            id: wire.id,
            node_type,
            config: Value::Object(config),
            position: None,
        });
    }
    Ok(Graph::new(specs, edges))
}

fn validate_virtual_graph(graph: &Graph, max_nodes: usize) -> Result<()> {
    if graph.nodes.is_empty() {
        return Err(TrellisError::Validation(
            "virtual workflow has no nodes".into(),
        ));
    }
    if graph.nodes.len() > max_nodes {
        return Err(TrellisError::Validation(format!(
            "virtual workflow has {} nodes (max {})",
            graph.nodes.len(),
            max_nodes
        )));
    }

    for node in &graph.nodes {
        match node.node_type {
            NodeType::Agent | NodeType::IfElse | NodeType::Guardrails => {}
            NodeType::Cognitive => {
                return Err(TrellisError::Validation(
                    "virtual workflow may not contain cognitive nodes".into(),
                ))
            }
            other => {
                return Err(TrellisError::Validation(format!(
                    "virtual workflow may not contain {} nodes",
                    other
                )))
            }
        }
    }

    let ids: std::collections::HashSet<&str> =
        graph.nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in &graph.edges {
        if !ids.contains(edge.source.as_str()) || !ids.contains(edge.target.as_str()) {
            return Err(TrellisError::Validation(format!(
                "virtual edge references unknown node: {} -> {}",
                edge.source, edge.target
            )));
        }
    }

    if graph.has_cycle() {
        return Err(TrellisError::Validation(
            "virtual workflow contains a cycle".into(),
        ));
    }
    if graph.entry_nodes().len() != 1 {
        return Err(TrellisError::Validation(format!(
            "virtual workflow must have exactly one entry node, found {}",
            graph.entry_nodes().len()
        )));
    }
    if graph.terminal_nodes().is_empty() {
        return Err(TrellisError::Validation(
            "virtual workflow has no terminal node".into(),
        ));
    }
    Ok(())
}

/// Execute the virtual workflow sequentially against an in-memory context.
///
/// No queue jobs and no ledger rows: the traversal is recorded in the trace
/// the caller stores on the outer entry.
async fn walk_virtual_graph(
    graph: &Graph,
    outer: &ExecContext,
    deps: &HandlerDeps,
) -> Result<(Value, Vec<Value>)> {
    let entries = graph.entry_nodes();
    let mut current = entries
        .first()
        .copied()
        .ok_or_else(|| TrellisError::Validation("virtual workflow has no entry node".into()))?;

    let mut input = outer.input.clone();
    let mut trace = Vec::new();

    for _ in 0..deps.config.engine.max_virtual_steps {
        let step_ctx = ExecContext {
            workflow_id: outer.workflow_id.clone(),
            run_id: outer.run_id.clone(),
            node_id: current.id.clone(),
            input: input.clone(),
        };

        debug!(node_id = %current.id, node_type = %current.node_type, "Virtual step");

        let outcome = match current.node_type {
            NodeType::Agent => agent::run(graph, current, &step_ctx, deps).await?,
            NodeType::IfElse => condition::run(graph, current, &step_ctx)?,
            NodeType::Guardrails => guardrails::run(graph, current, &step_ctx, deps).await?,
            // Excluded by validation
            other => {
                return Err(TrellisError::Validation(format!(
                    "virtual workflow may not contain {} nodes",
                    other
                )))
            }
        };

        let (output, next) = match outcome {
            Outcome::Advance { output, next, .. } => (output, next),
            Outcome::Suspend { .. } => {
                return Err(TrellisError::Validation(
                    "virtual workflow cannot suspend".into(),
                ))
            }
        };

        trace.push(json!({
            "node_id": current.id,
            "node_type": current.node_type,
            "output": output,
        }));

        input = output;
        match next.first() {
            Some(next_id) => {
                current = graph.node(next_id).ok_or_else(|| {
                    TrellisError::NodeNotFound(next_id.clone())
                })?;
            }
            None => return Ok((input, trace)),
        }
    }

    Err(TrellisError::Validation(
        "virtual workflow exceeded the step budget".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn virtual_node(id: &str, node_type: NodeType) -> NodeSpec {
        NodeSpec::new(id, node_type).with_config(json!({
            "lhs": "1", "rhs": "2", "condition": "<", "guardrail": "g",
        }))
    }

    #[test]
    fn rejects_nested_cognitive() {
        let graph = Graph::new(vec![virtual_node("a", NodeType::Cognitive)], vec![]);
        let err = validate_virtual_graph(&graph, 20).expect_err("must reject");
        assert!(err.to_string().contains("cognitive"));
    }

    #[test]
    fn rejects_disallowed_types() {
        let graph = Graph::new(vec![virtual_node("a", NodeType::Fork)], vec![]);
        assert!(validate_virtual_graph(&graph, 20).is_err());
    }

    #[test]
    fn rejects_too_many_nodes() {
        let nodes: Vec<NodeSpec> = (0..21)
            .map(|i| virtual_node(&format!("n{}", i), NodeType::Agent))
            .collect();
        let edges: Vec<EdgeSpec> = (0..20)
            .map(|i| EdgeSpec::new(format!("n{}", i), format!("n{}", i + 1)))
            .collect();
        let graph = Graph::new(nodes, edges);
        assert!(validate_virtual_graph(&graph, 20).is_err());
    }

    #[test]
    fn rejects_cycles_and_multiple_entries() {
        let cyclic = Graph::new(
            vec![
                virtual_node("a", NodeType::Agent),
                virtual_node("b", NodeType::Agent),
            ],
            vec![EdgeSpec::new("a", "b"), EdgeSpec::new("b", "a")],
        );
        assert!(validate_virtual_graph(&cyclic, 20).is_err());

        let two_entries = Graph::new(
            vec![
                virtual_node("a", NodeType::Agent),
                virtual_node("b", NodeType::Agent),
                virtual_node("c", NodeType::Agent),
            ],
            vec![EdgeSpec::new("a", "c"), EdgeSpec::new("b", "c")],
        );
        assert!(validate_virtual_graph(&two_entries, 20).is_err());
    }

    #[test]
    fn accepts_linear_agent_chain() {
        let graph = Graph::new(
            vec![
                virtual_node("a", NodeType::Agent),
                virtual_node("b", NodeType::Agent),
            ],
            vec![EdgeSpec::new("a", "b")],
        );
        assert!(validate_virtual_graph(&graph, 20).is_ok());
    }

    #[test]
    fn builds_graph_from_wire_shape() {
        let wire_nodes = vec![VirtualNodeWire {
            id: "n1".into(),
            data: json!({"type": "agent", "user_prompt": "hi"})
                .as_object()
                .expect("object")
                .clone(),
        }];
        let graph = build_virtual_graph(wire_nodes, vec![]).expect("build");
        assert_eq!(graph.nodes[0].node_type, NodeType::Agent);
        assert_eq!(graph.nodes[0].config["user_prompt"], json!("hi"));
        assert!(graph.nodes[0].config.get("type").is_none());
    }
}
