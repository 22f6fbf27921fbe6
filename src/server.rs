use axum::{
    middleware as axum_mw,
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::metrics::stream;
use crate::middleware::timing;
use crate::AppState;

/// Builds the full Axum `Router`: local health / metrics routes, with every
/// other request forwarded to the upstream through the instrumentation hook.
pub fn create_router(state: Arc<AppState>) -> Router {
    // ── Forwarding, instrumented ────────────────────────────────
    let proxied = Router::new()
        .fallback(handlers::proxy::forward)
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            timing::record_metrics,
        ))
        .with_state(state.clone());

    let config = &state.config;
    Router::new()
        // ── Local endpoints (not recorded, any method) ──────────
        .route(&config.health_endpoint, any(handlers::health::health))
        .route(&config.metrics_endpoint, any(stream::get_metrics))
        .route(
            &config.metrics_stream_endpoint(),
            get(stream::metrics_stream),
        )
        .with_state(state.clone())
        .fallback_service(proxied)
        .layer(TraceLayer::new_for_http())
}
