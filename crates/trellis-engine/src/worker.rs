use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::graph::NodeType;
use trellis_core::traits::JobQueue;
use trellis_core::types::{ApprovalRequest, Job, RunStatus};

use crate::coordinator::RunCoordinator;
use crate::handlers::{self, ExecContext, HandlerDeps, Outcome};

/// A pool of worker tasks consuming the job queue.
///
/// Parallel across jobs, sequential within one: each worker processes a
/// single job at a time through the full cycle — ledger row, event, handler
/// dispatch under the node timeout, successor enqueue, acknowledge.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<dyn JobQueue>,
        bus: Arc<EventBus>,
        coordinator: Arc<RunCoordinator>,
        deps: HandlerDeps,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker_id| {
                let queue = queue.clone();
                let bus = bus.clone();
                let coordinator = coordinator.clone();
                let deps = deps.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, queue, bus, coordinator, deps, cancel).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    bus: Arc<EventBus>,
    coordinator: Arc<RunCoordinator>,
    deps: HandlerDeps,
    cancel: CancellationToken,
) {
    info!(worker_id, "Worker started");
    loop {
        let delivery = tokio::select! {
            delivery = queue.dequeue() => delivery,
            _ = cancel.cancelled() => break,
        };

        let delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                error!(worker_id, error = %e, "Dequeue failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        debug!(
            worker_id,
            run_id = %delivery.job.run_id,
            node_id = %delivery.job.node_id,
            "Job dequeued"
        );

        if let Err(e) = process_job(&delivery.job, &queue, &bus, &coordinator, &deps).await {
            error!(
                worker_id,
                run_id = %delivery.job.run_id,
                node_id = %delivery.job.node_id,
                error = %e,
                "Job processing failed"
            );
        }

        if let Err(e) = queue.ack(delivery.receipt).await {
            error!(worker_id, error = %e, "Ack failed");
        }
    }
    info!(worker_id, "Worker stopped");
}

/// Execute one node-execution job end to end.
async fn process_job(
    job: &Job,
    queue: &Arc<dyn JobQueue>,
    bus: &Arc<EventBus>,
    coordinator: &Arc<RunCoordinator>,
    deps: &HandlerDeps,
) -> Result<()> {
    let store = &deps.store;

    // Node definitions are loaded at dequeue time, so in-flight runs follow
    // the current graph.
    let lookup = store.graph(&job.workflow_id).and_then(|graph| {
        graph
            .node(&job.node_id)
            .cloned()
            .map(|node| (graph, node))
            .ok_or_else(|| TrellisError::NodeNotFound(job.node_id.clone()))
    });
    let (graph, node) = match lookup {
        Ok(found) => found,
        Err(e) => {
            fail_run(job, bus, coordinator, &e.to_string()).await?;
            return Ok(());
        }
    };

    let entry = store.ledger_start(&job.run_id, &job.node_id, node.node_type, &job.input)?;

    bus.publish(
        &job.workflow_id,
        WorkflowEvent::NodeStarted {
            run_id: job.run_id.clone(),
            node_id: job.node_id.clone(),
            node_type: node.node_type,
            input_data: job.input.clone(),
            timestamp: Utc::now(),
        },
    );

    let ctx = ExecContext {
        workflow_id: job.workflow_id.clone(),
        run_id: job.run_id.clone(),
        node_id: job.node_id.clone(),
        input: job.input.clone(),
    };

    let budget = Duration::from_secs(deps.config.engine.node_timeout_secs);
    let result = match tokio::time::timeout(budget, handlers::dispatch(&graph, &node, &ctx, deps))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(TrellisError::NodeTimeout),
    };

    match result {
        Ok(Outcome::Advance {
            output,
            next,
            tool_calls,
        }) => {
            let duration_ms = store.ledger_finish(&entry.id, &output, tool_calls.as_ref())?;

            bus.publish(
                &job.workflow_id,
                WorkflowEvent::NodeCompleted {
                    run_id: job.run_id.clone(),
                    node_id: job.node_id.clone(),
                    node_type: node.node_type,
                    output_data: output.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                },
            );

            if node.node_type == NodeType::End {
                bus.publish(
                    &job.workflow_id,
                    WorkflowEvent::RunCompleted {
                        run_id: job.run_id.clone(),
                        workflow_id: job.workflow_id.clone(),
                        final_output: output.clone(),
                        timestamp: Utc::now(),
                    },
                );
            }

            for next_id in next {
                coordinator.job_added(&job.run_id).await;
                queue
                    .enqueue(Job {
                        run_id: job.run_id.clone(),
                        workflow_id: job.workflow_id.clone(),
                        node_id: next_id,
                        input: output.clone(),
                    })
                    .await?;
            }
            coordinator.job_done(&job.run_id).await?;
        }

        Ok(Outcome::Suspend { message }) => {
            // Ledger row stays open (no output, no finished_at) until resume
            // re-enters the node as a fresh row.
            store.create_approval(&ApprovalRequest {
                run_id: job.run_id.clone(),
                node_id: job.node_id.clone(),
                message: message.clone(),
                pending_input: job.input.clone(),
                created_at: Utc::now(),
            })?;
            store.set_run_status(&job.run_id, RunStatus::AwaitingApproval)?;

            bus.publish(
                &job.workflow_id,
                WorkflowEvent::ApprovalNeeded {
                    run_id: job.run_id.clone(),
                    node_id: job.node_id.clone(),
                    message,
                    timestamp: Utc::now(),
                },
            );
            coordinator.job_done(&job.run_id).await?;
        }

        Err(e) => {
            let message = e.to_string();
            store.ledger_fail(&entry.id, &message)?;
            fail_run(job, bus, coordinator, &message).await?;
        }
    }

    Ok(())
}

async fn fail_run(
    job: &Job,
    bus: &Arc<EventBus>,
    coordinator: &Arc<RunCoordinator>,
    message: &str,
) -> Result<()> {
    bus.publish(
        &job.workflow_id,
        WorkflowEvent::NodeError {
            run_id: job.run_id.clone(),
            node_id: job.node_id.clone(),
            message: message.to_string(),
            timestamp: Utc::now(),
        },
    );
    bus.publish(
        &job.workflow_id,
        WorkflowEvent::RunFailed {
            run_id: job.run_id.clone(),
            workflow_id: job.workflow_id.clone(),
            error: message.to_string(),
            timestamp: Utc::now(),
        },
    );
    coordinator.job_failed(&job.run_id).await
}
