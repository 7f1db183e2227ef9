use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub heartbeat: String,
    pub database_ok: bool,
    pub database_latency_ms: f64,
}

/// Liveness endpoint: process up + one round trip through the store.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.store.health_check().await;
    Json(HealthResponse {
        status: if health.ok { "ok" } else { "degraded" }.to_string(),
        heartbeat: chrono::Utc::now().to_rfc3339(),
        database_ok: health.ok,
        database_latency_ms: health.latency_ms,
    })
}
