use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Liveness plus a cheap look at the database through the queue depths.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.queue.health_check().await {
        Ok(queue) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "queue_running": queue.running })),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "error": err.to_string() })),
        ),
    }
}
