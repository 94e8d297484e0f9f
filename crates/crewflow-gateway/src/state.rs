use std::sync::Arc;

use crewflow_core::config::ServerConfig;
use crewflow_engine::ExecutionService;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: ServerConfig,
    pub service: Arc<ExecutionService>,
}
