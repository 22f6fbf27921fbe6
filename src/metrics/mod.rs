pub mod aggregator;
pub mod export;
pub mod normalizer;
pub mod percentiles;
pub mod process;
pub mod registry;
pub mod stream;

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use aggregator::Aggregator;
pub use normalizer::PathNormalizer;
pub use process::ProcessSource;
pub use registry::{CollectError, Registry};

/// A single completed request observed by the instrumentation hook.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    /// Uppercase HTTP verb
    pub method: String,
    /// Raw request path as received, before normalization
    pub path: String,
    /// Status sent back to the original caller
    pub status_code: u16,
    /// Wall time from just before forwarding until the response body was
    /// fully sent, or the caller went away
    pub duration: Duration,
    /// When the request started
    pub timestamp: DateTime<Utc>,
}

/// `200` → `"2xx"`. Codes outside 100..=599 are classed as given (`0` → `"0xx"`).
pub fn status_class(status_code: u16) -> String {
    format!("{}xx", status_code / 100)
}
