use axum::{
    extract::{Query, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::debug;

use super::export::{render_prometheus, ExportFormat, SnapshotDocument, PROMETHEUS_CONTENT_TYPE};
use crate::handlers::AppError;
use crate::AppState;

/// How often the live feed pushes a fresh snapshot.
const STREAM_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub format: Option<String>,
}

// ─── {metrics_endpoint} ──────────────────────────────────────────
/// JSON snapshot by default; `?format=prometheus` renders every registered
/// source in text exposition format.

pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<Response, AppError> {
    let format = match query.format.as_deref().filter(|f| !f.is_empty()) {
        Some(f) => f.parse::<ExportFormat>().map_err(AppError::BadRequest)?,
        None => state.config.metrics_format,
    };

    match format {
        ExportFormat::Json => {
            let snapshot = state.metrics.snapshot();
            Ok(Json(SnapshotDocument::from(&snapshot)).into_response())
        }
        ExportFormat::Prometheus => {
            let metrics = state.registry.collect_all()?;
            debug!(families = metrics.len(), "rendering prometheus exposition");
            Ok((
                [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
                render_prometheus(&metrics),
            )
                .into_response())
        }
    }
}

// ─── GET {metrics_endpoint}/stream ───────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes the JSON snapshot document once per interval.

pub async fn metrics_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(STREAM_INTERVAL);

    let stream = IntervalStream::new(interval).map(move |_| {
        let document = SnapshotDocument::from(&state.metrics.snapshot());
        let json = serde_json::to_string(&document).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
