use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::traits::{JobQueue, WorkflowStore};
use trellis_core::types::{Job, Run, RunId, RunStatus};

/// Initiates runs, resumes approval gates, and tracks run completion.
///
/// The coordinator keeps a live-job count per run: every enqueue increments
/// it, every processed job decrements it. When the count drains to zero and
/// the run is still `running`, the run is completed. This is what lets a
/// fork finish only when its last branch does, and a branch with no
/// successors (missing if_else edge) end the run cleanly.
pub struct RunCoordinator {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn JobQueue>,
    bus: Arc<EventBus>,
    live: Mutex<HashMap<String, usize>>,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue: Arc<dyn JobQueue>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Create a run and enqueue its start node.
    pub async fn start_run(&self, workflow_id: &str, input: Value) -> Result<Run> {
        let graph = self.store.graph(workflow_id)?;
        let start = graph.start_node().ok_or_else(|| {
            TrellisError::Validation(format!("workflow {} has no start node", workflow_id))
        })?;

        let run = self.store.create_run(workflow_id, &input)?;
        info!(run_id = %run.id, workflow_id, "Run started");

        self.bus.publish(
            workflow_id,
            WorkflowEvent::RunStarted {
                run_id: run.id.clone(),
                workflow_id: workflow_id.to_string(),
                initial_input: input.clone(),
                timestamp: Utc::now(),
            },
        );

        self.job_added(&run.id).await;
        self.queue
            .enqueue(Job {
                run_id: run.id.clone(),
                workflow_id: workflow_id.to_string(),
                node_id: start.id.clone(),
                input,
            })
            .await?;
        Ok(run)
    }

    /// Resume a run suspended at a user_approval node.
    ///
    /// Deletes the ApprovalRequest and re-enqueues the same node with the
    /// decision merged into the pending input; the handler's second entry
    /// sees `approval_decision` and routes instead of suspending. A second
    /// resume finds no ApprovalRequest and fails.
    pub async fn resume_approval(
        &self,
        workflow_id: &str,
        run_id: &RunId,
        node_id: &str,
        decision: &str,
    ) -> Result<()> {
        let run = self
            .store
            .run(run_id)?
            .ok_or_else(|| TrellisError::RunNotFound(run_id.to_string()))?;
        if run.workflow_id != workflow_id {
            return Err(TrellisError::RunNotFound(run_id.to_string()));
        }

        let pending = self.store.pending_approval(run_id)?;
        let matches = pending
            .as_ref()
            .map(|a| a.node_id == node_id)
            .unwrap_or(false);
        if !matches {
            return Err(TrellisError::AlreadyResumed(run_id.to_string()));
        }
        if run.status != RunStatus::AwaitingApproval {
            return Err(TrellisError::NotAwaitingApproval(run_id.to_string()));
        }

        let approval = self
            .store
            .take_approval(run_id, node_id)?
            .ok_or_else(|| TrellisError::AlreadyResumed(run_id.to_string()))?;

        self.store.set_run_status(run_id, RunStatus::Running)?;
        info!(run_id = %run_id, node_id, decision, "Approval resumed");

        let mut input = approval.pending_input;
        if let Value::Object(map) = &mut input {
            map.insert("approval_decision".into(), json!(decision));
            map.insert("approval_message".into(), json!(approval.message));
        }

        self.job_added(run_id).await;
        self.queue
            .enqueue(Job {
                run_id: run_id.clone(),
                workflow_id: workflow_id.to_string(),
                node_id: approval.node_id,
                input,
            })
            .await?;
        Ok(())
    }

    /// Start a fresh run with the initial input of an earlier one.
    pub async fn replay(&self, run_id: &RunId) -> Result<Run> {
        let original = self
            .store
            .run(run_id)?
            .ok_or_else(|| TrellisError::RunNotFound(run_id.to_string()))?;
        self.start_run(&original.workflow_id, original.initial_input)
            .await
    }

    /// Record that a job for this run entered the queue.
    pub async fn job_added(&self, run_id: &RunId) {
        let mut live = self.live.lock().await;
        *live.entry(run_id.0.clone()).or_insert(0) += 1;
    }

    /// Record that a job finished; completes the run when the last live job
    /// drains and the run is still `running`.
    pub async fn job_done(&self, run_id: &RunId) -> Result<()> {
        if self.job_removed(run_id).await {
            if let Some(run) = self.store.run(run_id)? {
                if run.status == RunStatus::Running {
                    self.store.finish_run(run_id, RunStatus::Completed)?;
                    info!(run_id = %run_id, "Run completed");
                }
            }
        }
        Ok(())
    }

    /// Record a failed job: the run is marked failed immediately, while
    /// sibling branches keep executing.
    pub async fn job_failed(&self, run_id: &RunId) -> Result<()> {
        if let Some(run) = self.store.run(run_id)? {
            if !run.status.is_terminal() {
                self.store.finish_run(run_id, RunStatus::Failed)?;
            }
        }
        self.job_removed(run_id).await;
        Ok(())
    }

    /// Decrement the live count; true when it drained to zero.
    async fn job_removed(&self, run_id: &RunId) -> bool {
        let mut live = self.live.lock().await;
        match live.get_mut(&run_id.0) {
            Some(count) => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    live.remove(&run_id.0);
                    true
                } else {
                    debug!(run_id = %run_id, remaining = *count, "Branch finished");
                    false
                }
            }
            None => true,
        }
    }
}
