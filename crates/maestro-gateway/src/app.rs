use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;

use maestro_engine::Orchestrator;
use maestro_tasks::TaskScheduler;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub orch: Arc<Orchestrator>,
    pub scheduler: Arc<TaskScheduler>,
    pub started_at: Instant,
    /// Cancelled once on ctrl-c; every long-lived loop watches it.
    pub shutdown: CancellationToken,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .route("/ask", post(crate::http::plugin::ask_handler))
        .route("/notify", post(crate::http::plugin::notify_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
