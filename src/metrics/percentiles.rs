use hdrhistogram::Histogram;
use serde::Serialize;

/// Latency percentile breakdown in milliseconds.
/// The histogram underneath records microseconds.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PercentileSet {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub count: u64,
}

impl PercentileSet {
    /// Extract a full percentile set from a microsecond HdrHistogram.
    /// Returns zeroed values if the histogram is empty.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.len() == 0 {
            return Self::empty();
        }

        Self {
            min: us_to_ms(hist.min()),
            max: us_to_ms(hist.max()),
            mean: hist.mean() / 1_000.0,
            p50: us_to_ms(hist.value_at_percentile(50.0)),
            p95: us_to_ms(hist.value_at_percentile(95.0)),
            p99: us_to_ms(hist.value_at_percentile(99.0)),
            p999: us_to_ms(hist.value_at_percentile(99.9)),
            count: hist.len(),
        }
    }

    /// All-zero placeholder used before any samples are recorded.
    pub fn empty() -> Self {
        Self {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            p50: 0.0,
            p95: 0.0,
            p99: 0.0,
            p999: 0.0,
            count: 0,
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1_000.0
}
