use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use trellis_core::config::GatewayConfig;
use trellis_core::event::EventBus;
use trellis_core::traits::WorkflowStore;
use trellis_engine::RunCoordinator;

use crate::routes;
use crate::state::AppState;

/// HTTP + WebSocket gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    store: Arc<dyn WorkflowStore>,
    coordinator: Arc<RunCoordinator>,
    bus: Arc<EventBus>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn WorkflowStore>,
        coordinator: Arc<RunCoordinator>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            store,
            coordinator,
            bus,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            bus: self.bus.clone(),
        });

        let app = Router::new()
            .route("/api/health", get(routes::health))
            .route(
                "/api/workflows/{id}/execute",
                post(routes::execute_workflow),
            )
            .route(
                "/api/workflows/{id}/runs/{run_id}/nodes/{node_id}/approve",
                post(routes::approve_node),
            )
            .route("/api/workflows/{id}/runs", get(routes::list_runs))
            .route("/api/runs/{run_id}/replay", post(routes::replay_run))
            .route("/api/runs/{run_id}/ledger", get(routes::run_ledger))
            .route("/api/ws/workflows/{id}", get(routes::ws_handler))
            .layer(CorsLayer::permissive())
            .with_state(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
