use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::graph::{Graph, GraphWarning, NodeType};
use crate::types::*;

/// LLM client — complete chat turns with optional tool declarations.
pub trait ChatClient: Send + Sync + 'static {
    /// Send a conversation and receive the full response.
    fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<ChatResponse>>;
}

/// Tool invoker — executes an LLM tool call against its backing API.
pub trait ToolInvoker: Send + Sync + 'static {
    /// Invoke the tool with the given arguments, returning the JSON result.
    fn invoke(&self, spec: &ToolSpec, arguments: Value) -> BoxFuture<'_, Result<Value>>;
}

/// Job queue — FIFO hand-off of node-execution jobs across workers.
///
/// At-least-once: a dequeued job that is never acknowledged is redelivered,
/// so a worker dying mid-job loses nothing.
pub trait JobQueue: Send + Sync + 'static {
    /// Enqueue a job; returns once the queue has durably accepted it.
    fn enqueue(&self, job: Job) -> BoxFuture<'_, Result<()>>;

    /// Blocking dequeue of the next job.
    fn dequeue(&self) -> BoxFuture<'_, Result<Delivery>>;

    /// Acknowledge a delivery after the job is fully processed.
    fn ack(&self, receipt: u64) -> BoxFuture<'_, Result<()>>;
}

/// Persistence backend for workflows, runs, the ledger, approvals, and tools.
///
/// Methods are synchronous row-scoped operations; implementations guard
/// their connection internally.
pub trait WorkflowStore: Send + Sync + 'static {
    // Workflows
    /// Validate and persist a workflow graph snapshot. Returns non-fatal
    /// validation warnings.
    fn save_workflow(&self, record: &WorkflowRecord, graph: &Graph) -> Result<Vec<GraphWarning>>;
    fn workflow(&self, id: &str) -> Result<Option<WorkflowRecord>>;
    fn graph(&self, workflow_id: &str) -> Result<Graph>;

    // Runs
    fn create_run(&self, workflow_id: &str, initial_input: &Value) -> Result<Run>;
    fn run(&self, id: &RunId) -> Result<Option<Run>>;
    fn set_run_status(&self, id: &RunId, status: RunStatus) -> Result<()>;
    /// Set a terminal status and stamp `finished_at`.
    fn finish_run(&self, id: &RunId, status: RunStatus) -> Result<()>;
    fn list_runs(&self, workflow_id: &str) -> Result<Vec<Run>>;

    // Ledger
    /// Append a new ledger row with the next per-run sequence number.
    fn ledger_start(
        &self,
        run_id: &RunId,
        node_id: &str,
        node_type: NodeType,
        input: &Value,
    ) -> Result<LedgerEntry>;
    /// Finish a row with its output; returns the recorded duration in ms.
    fn ledger_finish(
        &self,
        entry_id: &str,
        output: &Value,
        tool_calls: Option<&Value>,
    ) -> Result<i64>;
    /// Finish a row with an error.
    fn ledger_fail(&self, entry_id: &str, error: &str) -> Result<()>;
    /// All rows for a run, ordered by sequence.
    fn ledger(&self, run_id: &RunId) -> Result<Vec<LedgerEntry>>;

    // Approvals
    fn create_approval(&self, approval: &ApprovalRequest) -> Result<()>;
    /// Atomically fetch-and-delete the pending approval for `(run, node)`.
    fn take_approval(&self, run_id: &RunId, node_id: &str) -> Result<Option<ApprovalRequest>>;
    fn pending_approval(&self, run_id: &RunId) -> Result<Option<ApprovalRequest>>;

    // Tools
    fn save_tool(&self, tool: &ToolSpec) -> Result<()>;
    fn tool(&self, id: &str) -> Result<Option<ToolSpec>>;
}
