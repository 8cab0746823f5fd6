use serde_json::{json, Map};
use tracing::debug;

use trellis_core::error::Result;
use trellis_core::graph::{Graph, NodeSpec};

use super::{config_str, merge, ExecContext, Outcome};
use crate::template::{compare, resolve_value};

/// if_else: resolve both sides, compare, and pick exactly one branch.
///
/// A missing branch edge terminates that path rather than failing the run.
pub fn run(graph: &Graph, node: &NodeSpec, ctx: &ExecContext) -> Result<Outcome> {
    let lhs = config_str(node, "lhs")?;
    let rhs = config_str(node, "rhs")?;
    let operator = config_str(node, "condition")?;

    let lhs_value = resolve_value(lhs, &ctx.input);
    let rhs_value = resolve_value(rhs, &ctx.input);
    let result = compare(&lhs_value, operator, &rhs_value)?;

    debug!(
        node_id = %node.id,
        result,
        operator,
        "Condition evaluated"
    );

    let mut fields = Map::new();
    fields.insert("condition".into(), json!(result));
    fields.insert("lhs_value".into(), lhs_value);
    fields.insert("rhs_value".into(), rhs_value);
    fields.insert("operator".into(), json!(operator));

    let branch = if result { "true" } else { "false" };
    let next = graph.successors(&node.id, Some(branch));

    Ok(Outcome::advance(merge(&ctx.input, fields), next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::graph::{EdgeSpec, NodeType};
    use trellis_core::types::RunId;

    fn branch_graph() -> Graph {
        Graph::new(
            vec![
                NodeSpec::new("cond", NodeType::IfElse).with_config(json!({
                    "lhs": "{{input.age}}",
                    "condition": ">",
                    "rhs": "18",
                })),
                NodeSpec::new("adult", NodeType::End),
                NodeSpec::new("minor", NodeType::End),
            ],
            vec![
                EdgeSpec::new("cond", "adult").with_handle("true"),
                EdgeSpec::new("cond", "minor").with_handle("false"),
            ],
        )
    }

    fn ctx(input: serde_json::Value) -> ExecContext {
        ExecContext {
            workflow_id: "wf".into(),
            run_id: RunId::new(),
            node_id: "cond".into(),
            input,
        }
    }

    #[test]
    fn true_branch_selected() {
        let graph = branch_graph();
        let node = graph.node("cond").expect("node");
        let outcome = run(&graph, node, &ctx(json!({"age": 21}))).expect("run");
        match outcome {
            Outcome::Advance { output, next, .. } => {
                assert_eq!(next, vec!["adult".to_string()]);
                assert_eq!(output["condition"], json!(true));
                assert_eq!(output["lhs_value"], json!(21));
                assert_eq!(output["rhs_value"], json!("18"));
                assert_eq!(output["operator"], json!(">"));
                // Accumulation: input survives
                assert_eq!(output["age"], json!(21));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn false_branch_selected() {
        let graph = branch_graph();
        let node = graph.node("cond").expect("node");
        let outcome = run(&graph, node, &ctx(json!({"age": 5}))).expect("run");
        match outcome {
            Outcome::Advance { next, output, .. } => {
                assert_eq!(next, vec!["minor".to_string()]);
                assert_eq!(output["condition"], json!(false));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn missing_branch_terminates_path() {
        let graph = Graph::new(
            vec![
                NodeSpec::new("cond", NodeType::IfElse).with_config(json!({
                    "lhs": "{{input.age}}",
                    "condition": ">",
                    "rhs": "18",
                })),
                NodeSpec::new("adult", NodeType::End),
            ],
            vec![EdgeSpec::new("cond", "adult").with_handle("true")],
        );
        let node = graph.node("cond").expect("node");
        let outcome = run(&graph, node, &ctx(json!({"age": 5}))).expect("run");
        match outcome {
            Outcome::Advance { next, .. } => assert!(next.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn missing_config_field_fails() {
        let graph = Graph::new(
            vec![NodeSpec::new("cond", NodeType::IfElse).with_config(json!({"lhs": "1"}))],
            vec![],
        );
        let node = graph.node("cond").expect("node");
        assert!(run(&graph, node, &ctx(json!({}))).is_err());
    }
}
