//! Loopback endpoints for the assistant's tool plugins.
//!
//! The subprocess's ask_user/notify_user plugins call back into this
//! process, authenticated by the per-process bearer secret injected into
//! their environment at launch.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{debug, warn};

use maestro_engine::ask::{normalize_questions, ANSWER_SESSION_ENDED};
use maestro_protocol::server::ServerEvent;

use crate::app::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskBody {
    request_id: String,
    session_id: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    questions: Option<serde_json::Value>,
    #[serde(default)]
    options: Option<serde_json::Value>,
    #[serde(default)]
    input_type: Option<String>,
}

/// POST /ask. Held open until a client answers, cancels, or the 5-minute
/// timeout resolves with the default answer.
pub async fn ask_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AskBody>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let questions = normalize_questions(
        &body.question,
        body.questions.as_ref(),
        body.options.as_ref(),
        body.input_type.as_deref(),
    );
    debug!(
        request_id = %body.request_id,
        session_id = %body.session_id,
        "ask-user question posted"
    );

    let rx = state.orch.post_question(
        &body.request_id,
        &body.session_id,
        body.question.clone(),
        questions,
    );

    // The sender only disappears when a newer question displaced this one
    // mid-flight; answer like a torn-down session.
    let answer = rx
        .await
        .unwrap_or_else(|_| ANSWER_SESSION_ENDED.to_string());
    Json(serde_json::json!({ "answer": answer })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyBody {
    session_id: String,
    #[serde(default = "default_level")]
    level: String,
    title: String,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
}

fn default_level() -> String {
    "info".to_string()
}

/// POST /notify. Fire-and-forget progress; never blocks, holds no state.
pub async fn notify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<NotifyBody>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    state.orch.emit(
        &body.session_id,
        &ServerEvent::Notification {
            session_id: Some(body.session_id.clone()),
            level: body.level,
            title: body.title,
            detail: body.detail,
            progress: body.progress,
        },
    );
    Json(serde_json::json!({ "ok": true })).into_response()
}

fn authorized(state: &Arc<AppState>, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", state.orch.plugin_secret);
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected.as_str()) {
        true
    } else {
        warn!("plugin endpoint rejected: bad bearer");
        false
    }
}
