use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use http_body::{Frame, SizeHint};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::debug;

use crate::metrics::{Aggregator, MetricRecord};
use crate::AppState;

/// Instrumentation hook around the forwarding fallback.
///
/// Runs exactly once per proxied request, failed forwards included (the
/// handler turns those into 502/504 responses before this sees them). The
/// record is taken when the response body has been fully streamed, or when
/// the body is dropped early because the caller disconnected.
pub async fn record_metrics(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().as_str().to_ascii_uppercase();
    let path = req.uri().path().to_owned();

    let timestamp = Utc::now();
    let start = Instant::now();
    let response = next.run(req).await;

    let pending = PendingRecord {
        metrics: state.metrics.clone(),
        method,
        path,
        status_code: response.status().as_u16(),
        timestamp,
        start,
    };
    response.map(|body| {
        Body::new(TimedBody {
            inner: body,
            pending: Some(pending),
        })
    })
}

struct PendingRecord {
    metrics: Arc<Aggregator>,
    method: String,
    path: String,
    status_code: u16,
    timestamp: DateTime<Utc>,
    start: Instant,
}

impl PendingRecord {
    fn finish(self) {
        let duration = self.start.elapsed();
        debug!(
            method = %self.method,
            path = %self.path,
            status = self.status_code,
            latency_us = duration.as_micros() as u64,
            "proxied request"
        );

        self.metrics.record(MetricRecord {
            method: self.method,
            path: self.path,
            status_code: self.status_code,
            duration,
            timestamp: self.timestamp,
        });
    }
}

/// Response body that records its request once the last frame is out.
struct TimedBody {
    inner: Body,
    pending: Option<PendingRecord>,
}

impl TimedBody {
    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.finish();
        }
    }
}

impl http_body::Body for TimedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.finish();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TimedBody {
    fn drop(&mut self) {
        // Bodies the server never polls to the end (HEAD, aborted clients).
        self.finish();
    }
}
