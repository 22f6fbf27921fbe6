//! Renderings of the aggregate for the metrics endpoint.
//!
//! JSON is built straight from an [`AggregateSnapshot`]. The Prometheus text
//! format renders whatever the [`Registry`](super::Registry) collected, so
//! every registered source ends up on the same page.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::str::FromStr;

use serde::Serialize;

use super::aggregator::AggregateSnapshot;
use super::percentiles::PercentileSet;
use super::registry::Metric;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Output format selected by the `format` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Prometheus,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "prometheus" | "prom" | "text" => Ok(Self::Prometheus),
            other => Err(format!("unknown metrics format '{other}' (expected json or prometheus)")),
        }
    }
}

// ─── JSON document ───────────────────────────────────────────────

/// The JSON document served by the metrics endpoint and the SSE feed.
/// Field names are part of the public contract.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDocument {
    pub total_requests: u64,
    pub request_rate: f64,
    pub avg_response_time_ms: f64,
    pub status_codes: BTreeMap<u16, u64>,
    pub status_classes: BTreeMap<String, u64>,
    pub latency_ms: PercentileSet,
    pub routes: Vec<RouteDocument>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteDocument {
    pub method: String,
    pub path: String,
    pub status_class: String,
    pub count: u64,
    pub avg_response_time_ms: f64,
}

impl From<&AggregateSnapshot> for SnapshotDocument {
    fn from(snapshot: &AggregateSnapshot) -> Self {
        Self {
            total_requests: snapshot.total_requests,
            request_rate: snapshot.request_rate(),
            avg_response_time_ms: snapshot.avg_duration().as_secs_f64() * 1_000.0,
            status_codes: snapshot.status_code_counts.clone(),
            status_classes: snapshot.status_class_counts(),
            latency_ms: snapshot.latency.clone(),
            routes: snapshot
                .routes
                .iter()
                .map(|r| RouteDocument {
                    method: r.method.clone(),
                    path: r.path.clone(),
                    status_class: r.status_class.clone(),
                    count: r.count,
                    avg_response_time_ms: r.avg_duration().as_secs_f64() * 1_000.0,
                })
                .collect(),
        }
    }
}

// ─── Prometheus text exposition ──────────────────────────────────

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn format_value(v: f64) -> String {
    if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else if v.is_nan() {
        "NaN".to_string()
    } else {
        v.to_string()
    }
}

/// Render metric families in Prometheus text exposition format.
pub fn render_prometheus(metrics: &[Metric]) -> String {
    let mut out = String::new();

    for metric in metrics {
        let _ = writeln!(out, "# HELP {} {}", metric.name, metric.help);
        let _ = writeln!(out, "# TYPE {} {}", metric.name, metric.kind.as_str());

        for sample in &metric.samples {
            out.push_str(&sample.name);
            if !sample.labels.is_empty() {
                let labels = sample
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                    .collect::<Vec<_>>()
                    .join(",");
                let _ = write!(out, "{{{labels}}}");
            }
            let _ = writeln!(out, " {}", format_value(sample.value));
        }
    }

    out
}
