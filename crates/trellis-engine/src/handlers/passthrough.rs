use tracing::debug;

use trellis_core::error::Result;
use trellis_core::graph::{Graph, NodeSpec, NodeType};

use super::{ExecContext, Outcome};

/// start, end, and fork: no context mutation, only routing.
///
/// start and fork emit their input unchanged to every outgoing edge (a fork
/// with N edges becomes N independent jobs sharing the same input). end has
/// no successors and signals run completion to the worker.
pub fn run(graph: &Graph, node: &NodeSpec, ctx: &ExecContext) -> Result<Outcome> {
    let next = if node.node_type == NodeType::End {
        Vec::new()
    } else {
        graph.successors(&node.id, None)
    };

    if node.node_type == NodeType::Fork {
        debug!(
            node_id = %node.id,
            branches = next.len(),
            "Fork splitting into parallel branches"
        );
    }

    Ok(Outcome::advance(ctx.input.clone(), next))
}
