use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::NodeType;
use crate::types::RunId;

/// Lifecycle event published during workflow execution.
///
/// Serialized with a top-level `event_type` discriminator; this is the wire
/// format WebSocket clients receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Connected {
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    RunStarted {
        run_id: RunId,
        workflow_id: String,
        initial_input: Value,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        run_id: RunId,
        node_id: String,
        node_type: NodeType,
        input_data: Value,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        run_id: RunId,
        node_id: String,
        node_type: NodeType,
        output_data: Value,
        duration_ms: i64,
        timestamp: DateTime<Utc>,
    },
    NodeError {
        run_id: RunId,
        node_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    ApprovalNeeded {
        run_id: RunId,
        node_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        workflow_id: String,
        final_output: Value,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        workflow_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    /// The discriminator string used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::RunStarted { .. } => "run_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeError { .. } => "node_error",
            Self::ApprovalNeeded { .. } => "approval_needed",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
        }
    }
}

/// An event tagged with the workflow it belongs to.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub workflow_id: String,
    pub event: WorkflowEvent,
}

/// Event bus using a tokio broadcast channel, keyed by workflow id.
///
/// Delivery is best-effort fan-out: a slow subscriber lags and loses events
/// rather than blocking publishers.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, workflow_id: &str, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(EventEnvelope {
            workflow_id: workflow_id.to_string(),
            event,
        });
    }

    /// Subscribe to the events of a single workflow.
    pub fn subscribe(&self, workflow_id: &str) -> WorkflowEvents {
        WorkflowEvents {
            workflow_id: workflow_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A filtered subscription returned by [`EventBus::subscribe`].
pub struct WorkflowEvents {
    workflow_id: String,
    rx: tokio::sync::broadcast::Receiver<EventEnvelope>,
}

impl WorkflowEvents {
    /// Receive the next event for this workflow.
    ///
    /// Skips events for other workflows and lag gaps; returns `None` once
    /// the bus is dropped.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.rx.recv().await {
                Ok(env) if env.workflow_id == self.workflow_id => return Some(env.event),
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking drain of everything currently buffered.
    pub fn try_drain(&mut self) -> Vec<WorkflowEvent> {
        use tokio::sync::broadcast::error::TryRecvError;
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(env) if env.workflow_id == self.workflow_id => events.push(env.event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}
