use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub proxy_target: String,
}

// ─── {health_endpoint} ───────────────────────────────────────────
/// Liveness plus the upstream we forward to. Independent of metric state.

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        proxy_target: state.upstream.target().to_string(),
    })
}
