use std::sync::Arc;

use trellis_core::config::GatewayConfig;
use trellis_core::event::EventBus;
use trellis_core::traits::WorkflowStore;
use trellis_engine::RunCoordinator;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<dyn WorkflowStore>,
    pub coordinator: Arc<RunCoordinator>,
    pub bus: Arc<EventBus>,
}
