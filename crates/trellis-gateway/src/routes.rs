use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::{debug, info, warn};

use trellis_core::error::TrellisError;
use trellis_core::types::RunId;

use crate::connection;
use crate::middleware::Authenticated;
use crate::state::AppState;

fn error_status(e: &TrellisError) -> StatusCode {
    match e {
        TrellisError::WorkflowNotFound(_)
        | TrellisError::RunNotFound(_)
        | TrellisError::NodeNotFound(_)
        | TrellisError::AlreadyResumed(_) => StatusCode::NOT_FOUND,
        TrellisError::NotAwaitingApproval(_) => StatusCode::CONFLICT,
        TrellisError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Load the workflow and check the caller may touch it.
fn authorize_workflow(
    state: &AppState,
    auth: &crate::auth::AuthResult,
    workflow_id: &str,
) -> Result<(), StatusCode> {
    let workflow = state
        .store
        .workflow(workflow_id)
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;
    if auth.master || workflow.owner == auth.subject {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

// GET /api/health — no auth required
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /api/workflows/{id}/execute
pub async fn execute_workflow(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    authorize_workflow(&state, &auth, &workflow_id)?;

    match state.coordinator.start_run(&workflow_id, body).await {
        Ok(run) => Ok(Json(serde_json::json!({ "run_id": run.id }))),
        Err(e) => {
            warn!(workflow_id, error = %e, "Execute failed");
            Err(error_status(&e))
        }
    }
}

#[derive(Deserialize)]
pub struct ApproveBody {
    pub decision: String,
}

// POST /api/workflows/{id}/runs/{run_id}/nodes/{node_id}/approve
pub async fn approve_node(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path((workflow_id, run_id, node_id)): Path<(String, String, String)>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    authorize_workflow(&state, &auth, &workflow_id)?;

    let decision = body.decision.trim().to_lowercase();
    if decision != "yes" && decision != "no" {
        return Err(StatusCode::BAD_REQUEST);
    }

    let run_id = RunId::from_string(run_id);
    match state
        .coordinator
        .resume_approval(&workflow_id, &run_id, &node_id, &decision)
        .await
    {
        Ok(()) => {
            info!(%run_id, node_id, decision, "Approval decision applied");
            Ok(Json(serde_json::json!({
                "success": true,
                "run_id": run_id,
            })))
        }
        Err(e) => {
            warn!(%run_id, error = %e, "Approve failed");
            Err(error_status(&e))
        }
    }
}

// POST /api/runs/{run_id}/replay
pub async fn replay_run(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let run_id = RunId::from_string(run_id);
    let original = state
        .store
        .run(&run_id)
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;
    authorize_workflow(&state, &auth, &original.workflow_id)?;

    match state.coordinator.replay(&run_id).await {
        Ok(run) => Ok(Json(serde_json::json!({ "run_id": run.id }))),
        Err(e) => Err(error_status(&e)),
    }
}

// GET /api/workflows/{id}/runs
pub async fn list_runs(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    authorize_workflow(&state, &auth, &workflow_id)?;

    let runs = state
        .store
        .list_runs(&workflow_id)
        .map_err(|e| error_status(&e))?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

// GET /api/runs/{run_id}/ledger
pub async fn run_ledger(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let run_id = RunId::from_string(run_id);
    let run = state
        .store
        .run(&run_id)
        .map_err(|e| error_status(&e))?
        .ok_or(StatusCode::NOT_FOUND)?;
    authorize_workflow(&state, &auth, &run.workflow_id)?;

    let entries = state.store.ledger(&run_id).map_err(|e| error_status(&e))?;
    Ok(Json(serde_json::json!({ "ledger": entries })))
}

// GET /api/ws/workflows/{id}?auth-token=… — WebSocket subscription
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    authorize_workflow(&state, &auth, &workflow_id)?;

    Ok(ws.on_upgrade(move |socket| async move {
        info!(workflow_id, "WebSocket client connected");
        connection::handle_connection(socket, workflow_id.clone(), state.bus.clone()).await;
        debug!(workflow_id, "WebSocket client disconnected");
    }))
}
