use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde_json::json;

use crate::state::RelayState;

pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(state.stats())
}

pub async fn metrics_handler(State(state): State<RelayState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}
