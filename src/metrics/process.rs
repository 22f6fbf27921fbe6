use std::time::Instant;

use chrono::{DateTime, Utc};

use super::registry::{CollectError, Metric, MetricSource};

/// Process-level metrics that live alongside the request aggregate.
pub struct ProcessSource {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl ProcessSource {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

impl Default for ProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for ProcessSource {
    fn name(&self) -> &str {
        "process"
    }

    fn collect(&self) -> Result<Vec<Metric>, CollectError> {
        let start_secs = self.started_at.timestamp_millis() as f64 / 1_000.0;
        Ok(vec![
            Metric::gauge(
                "process_start_time_seconds",
                "Start time of the process since unix epoch in seconds",
            )
            .with_value(start_secs),
            Metric::gauge("process_uptime_seconds", "Seconds since the process started")
                .with_value(self.uptime_secs()),
        ])
    }
}
