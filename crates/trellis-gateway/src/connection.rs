use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::debug;

use trellis_core::event::{EventBus, WorkflowEvent};

/// Handle a single WebSocket subscription for one workflow.
///
/// Sends the `connected` handshake, then forwards every bus event for the
/// workflow as a JSON frame. Writes are serialized through a mutex so the
/// event task and the ping handler never interleave frames.
pub async fn handle_connection(ws: WebSocket, workflow_id: String, bus: Arc<EventBus>) {
    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));

    // Handshake
    let connected = WorkflowEvent::Connected {
        workflow_id: workflow_id.clone(),
        timestamp: Utc::now(),
    };
    if let Ok(json) = serde_json::to_string(&connected) {
        let mut tx = ws_tx.lock().await;
        if tx.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    // Forward bus events for this workflow
    let mut events = bus.subscribe(&workflow_id);
    let event_ws_tx = ws_tx.clone();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    debug!(error = %e, "Failed to serialize event");
                    continue;
                }
            };
            let mut tx = event_ws_tx.lock().await;
            if tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Read incoming frames until the client goes away
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Close(_) => break,
            Message::Ping(data) => {
                let mut tx = ws_tx.lock().await;
                let _ = tx.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }

    event_task.abort();
    debug!(workflow_id, "Connection closed");
}
