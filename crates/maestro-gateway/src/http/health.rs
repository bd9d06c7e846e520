use std::sync::Arc;

use axum::{extract::State, Json};

use crate::app::AppState;

/// GET /health: liveness probe with version and uptime.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "name": "maestro",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
