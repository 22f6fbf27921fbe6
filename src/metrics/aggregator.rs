use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use super::normalizer::PathNormalizer;
use super::percentiles::PercentileSet;
use super::registry::{CollectError, Metric, MetricSource};
use super::{status_class, MetricRecord};

// ─── Configuration ───────────────────────────────────────────────

const BUCKET_COUNT: usize = 11;

/// Upper bounds (seconds) of the per-route latency buckets.
pub const LATENCY_BUCKETS_SECS: [f64; BUCKET_COUNT] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// HdrHistogram range: 1 μs → 1 h, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 3_600_000_000;
const HIST_SIGFIG: u8 = 3;

const SOURCE_NAME: &str = "http_requests";

// ─── Public types ────────────────────────────────────────────────

/// Thread-safe request metrics engine.
/// The instrumentation hook calls `record()`, exporters call `snapshot()`.
///
/// Totals, status codes and timestamps share one lock, so a snapshot never
/// sees the total advanced without the matching status-code increment. The
/// route table and the latency histogram sit behind their own locks and may
/// trail the totals by records still in flight.
pub struct Aggregator {
    normalizer: PathNormalizer,
    totals: RwLock<Totals>,
    routes: RwLock<HashMap<RouteKey, RouteStats>>,
    latency: Latency,
}

/// Per-route view: one entry per (method, normalized path, status class).
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSnapshot {
    pub method: String,
    pub path: String,
    pub status_class: String,
    pub count: u64,
    pub total_duration: Duration,
    /// Cumulative counts aligned with [`LATENCY_BUCKETS_SECS`].
    pub bucket_counts: Vec<u64>,
}

impl RouteSnapshot {
    pub fn avg_duration(&self) -> Duration {
        average(self.total_duration, self.count)
    }
}

/// Point-in-time copy of the aggregate. Owns all of its data.
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    pub total_requests: u64,
    pub total_duration: Duration,
    pub status_code_counts: BTreeMap<u16, u64>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub latency: PercentileSet,
    /// Sorted by method, then path, then status class.
    pub routes: Vec<RouteSnapshot>,
}

impl AggregateSnapshot {
    /// Requests per second between the first and the last recorded request.
    /// Zero until two distinct timestamps have been seen.
    pub fn request_rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.first_timestamp, self.last_timestamp) else {
            return 0.0;
        };
        match (last - first).to_std() {
            Ok(span) if !span.is_zero() => self.total_requests as f64 / span.as_secs_f64(),
            _ => 0.0,
        }
    }

    pub fn avg_duration(&self) -> Duration {
        average(self.total_duration, self.total_requests)
    }

    /// Exact status codes folded into classes (`2xx`, `4xx`, …).
    pub fn status_class_counts(&self) -> BTreeMap<String, u64> {
        let mut classes = BTreeMap::new();
        for (&code, &count) in &self.status_code_counts {
            *classes.entry(status_class(code)).or_insert(0) += count;
        }
        classes
    }
}

// ─── Internal state ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct RouteKey {
    method: String,
    path: String,
    status_class: String,
}

#[derive(Debug, Clone, Default)]
struct RouteStats {
    count: u64,
    total_duration: Duration,
    // Non-cumulative; anything past the last bound only shows up in `count`.
    buckets: [u64; BUCKET_COUNT],
}

#[derive(Debug, Default)]
struct Totals {
    total_requests: u64,
    total_duration: Duration,
    status_codes: HashMap<u16, u64>,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Latency histogram split in two. Writers only touch `recent`; a snapshot
/// swaps it for an empty one and folds it into `merged` on its own time.
struct Latency {
    recent: Mutex<Histogram<u64>>,
    merged: Mutex<Histogram<u64>>,
}

// ─── Aggregator impl ─────────────────────────────────────────────

impl Aggregator {
    pub fn new() -> Self {
        Self::with_normalizer(PathNormalizer::new())
    }

    pub fn with_normalizer(normalizer: PathNormalizer) -> Self {
        Self {
            normalizer,
            totals: RwLock::new(Totals::default()),
            routes: RwLock::new(HashMap::new()),
            latency: Latency::new(),
        }
    }

    /// Record a single completed request. Never fails; input is taken as given.
    pub fn record(&self, record: MetricRecord) {
        // Labels never carry a query string.
        let raw_path = record
            .path
            .split_once('?')
            .map_or(record.path.as_str(), |(path, _)| path);

        // Normalization is the expensive part, keep it outside the locks.
        let key = RouteKey {
            path: self.normalizer.normalize(raw_path),
            status_class: status_class(record.status_code),
            method: record.method,
        };

        self.totals
            .write()
            .record(record.status_code, record.duration, record.timestamp);

        {
            let mut routes = self.routes.write();
            routes.entry(key).or_default().record(record.duration);
        }

        self.latency.record(record.duration);
    }

    /// Produce an independent snapshot.
    pub fn snapshot(&self) -> AggregateSnapshot {
        // Only scalars and status codes are copied under the totals lock.
        let mut snapshot = {
            let totals = self.totals.read();
            AggregateSnapshot {
                total_requests: totals.total_requests,
                total_duration: totals.total_duration,
                status_code_counts: totals
                    .status_codes
                    .iter()
                    .map(|(&code, &count)| (code, count))
                    .collect(),
                first_timestamp: totals.first_timestamp,
                last_timestamp: totals.last_timestamp,
                latency: PercentileSet::empty(),
                routes: Vec::new(),
            }
        };

        let mut routes: Vec<_> = self
            .routes
            .read()
            .iter()
            .map(|(key, stats)| (key.clone(), stats.count, stats.total_duration, stats.buckets))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot.routes = routes
            .into_iter()
            .map(|(key, count, total_duration, buckets)| RouteSnapshot {
                method: key.method,
                path: key.path,
                status_class: key.status_class,
                count,
                total_duration,
                bucket_counts: buckets
                    .iter()
                    .scan(0u64, |acc, &n| {
                        *acc += n;
                        Some(*acc)
                    })
                    .collect(),
            })
            .collect();

        snapshot.latency = self.latency.percentiles();
        snapshot
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for Aggregator {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn collect(&self) -> Result<Vec<Metric>, CollectError> {
        let snapshot = self.snapshot();

        let mut requests = Metric::counter(
            "http_requests_total",
            "Total number of HTTP requests",
        );
        let mut duration = Metric::histogram(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        );

        for route in &snapshot.routes {
            let labels = [
                ("method", route.method.as_str()),
                ("handler", route.path.as_str()),
                ("status", route.status_class.as_str()),
            ];
            requests.push(&labels, route.count as f64);

            for (bound, &cumulative) in LATENCY_BUCKETS_SECS.iter().zip(&route.bucket_counts) {
                let le = bound.to_string();
                let mut bucket_labels = labels.to_vec();
                bucket_labels.push(("le", le.as_str()));
                duration.push_suffixed("_bucket", &bucket_labels, cumulative as f64);
            }
            let mut inf_labels = labels.to_vec();
            inf_labels.push(("le", "+Inf"));
            duration.push_suffixed("_bucket", &inf_labels, route.count as f64);
            duration.push_suffixed("_sum", &labels, route.total_duration.as_secs_f64());
            duration.push_suffixed("_count", &labels, route.count as f64);
        }

        let mut by_code = Metric::counter(
            "http_responses_by_code_total",
            "Responses by exact HTTP status code",
        );
        for (code, count) in &snapshot.status_code_counts {
            by_code.push(&[("code", code.to_string().as_str())], *count as f64);
        }

        Ok(vec![
            requests,
            duration,
            by_code,
            Metric::gauge(
                "http_request_rate",
                "Requests per second between the first and last recorded request",
            )
            .with_value(snapshot.request_rate()),
            Metric::gauge(
                "http_request_duration_avg_seconds",
                "Mean HTTP request duration in seconds",
            )
            .with_value(snapshot.avg_duration().as_secs_f64()),
        ])
    }
}

// ─── Internal impls ──────────────────────────────────────────────

impl Totals {
    fn record(&mut self, status_code: u16, duration: Duration, timestamp: DateTime<Utc>) {
        self.first_timestamp.get_or_insert(timestamp);
        self.last_timestamp = Some(timestamp);

        self.total_requests += 1;
        self.total_duration = self.total_duration.saturating_add(duration);
        *self.status_codes.entry(status_code).or_insert(0) += 1;
    }
}

impl RouteStats {
    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration = self.total_duration.saturating_add(duration);
        let secs = duration.as_secs_f64();
        if let Some(i) = LATENCY_BUCKETS_SECS.iter().position(|&bound| secs <= bound) {
            self.buckets[i] += 1;
        }
    }
}

impl Latency {
    fn new() -> Self {
        Self {
            recent: Mutex::new(new_histogram()),
            merged: Mutex::new(new_histogram()),
        }
    }

    fn record(&self, duration: Duration) {
        // Clamp to ≥ 1 μs
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX).max(1);
        self.recent.lock().saturating_record(us);
    }

    fn percentiles(&self) -> PercentileSet {
        // Allocate before taking the writers' lock; the swap itself is O(1).
        let fresh = new_histogram();
        let drained = std::mem::replace(&mut *self.recent.lock(), fresh);

        let mut merged = self.merged.lock();
        if let Err(e) = merged.add(&drained) {
            warn!(error = ?e, "dropping latency samples that could not be merged");
        }
        PercentileSet::from_histogram(&merged)
    }
}

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG).expect("histogram creation")
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;

    fn record_at(method: &str, path: &str, status: u16, ms: u64, ts: DateTime<Utc>) -> MetricRecord {
        MetricRecord {
            method: method.to_string(),
            path: path.to_string(),
            status_code: status,
            duration: Duration::from_millis(ms),
            timestamp: ts,
        }
    }

    fn record(method: &str, path: &str, status: u16, ms: u64) -> MetricRecord {
        record_at(method, path, status, ms, Utc::now())
    }

    #[test]
    fn empty_snapshot() {
        let snap = Aggregator::new().snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.avg_duration(), Duration::ZERO);
        assert_eq!(snap.request_rate(), 0.0);
        assert!(snap.status_code_counts.is_empty());
        assert!(snap.status_class_counts().is_empty());
        assert!(snap.routes.is_empty());
        assert!(snap.first_timestamp.is_none());
        assert!(!snap.latency.has_data());
    }

    #[test]
    fn rate_over_ten_seconds() {
        let agg = Aggregator::new();
        let t0 = Utc::now();
        agg.record(record_at("GET", "/a", 200, 5, t0));
        agg.record(record_at("GET", "/a", 200, 5, t0 + chrono::Duration::seconds(10)));

        let snap = agg.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert!((snap.request_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn single_record_has_zero_rate() {
        let agg = Aggregator::new();
        agg.record(record("GET", "/a", 200, 5));
        assert_eq!(agg.snapshot().request_rate(), 0.0);
    }

    #[test]
    fn out_of_order_timestamps_keep_call_order() {
        let agg = Aggregator::new();
        let t0 = Utc::now();
        let later = t0 + chrono::Duration::seconds(5);
        agg.record(record_at("GET", "/a", 200, 1, later));
        agg.record(record_at("GET", "/a", 200, 1, t0));

        let snap = agg.snapshot();
        assert_eq!(snap.first_timestamp, Some(later));
        assert_eq!(snap.last_timestamp, Some(t0));
        // Negative span reports no rate
        assert_eq!(snap.request_rate(), 0.0);
    }

    #[test]
    fn average_duration() {
        let agg = Aggregator::new();
        agg.record(record("GET", "/a", 200, 10));
        agg.record(record("GET", "/a", 200, 30));

        let snap = agg.snapshot();
        assert_eq!(snap.total_duration, Duration::from_millis(40));
        let avg_ms = snap.avg_duration().as_secs_f64() * 1_000.0;
        assert!((avg_ms - 20.0).abs() < 1e-6);
        assert!((snap.latency.p50 - 10.0).abs() < 0.1);
    }

    #[test]
    fn status_codes_and_classes_derive_from_same_counts() {
        let agg = Aggregator::new();
        for status in [200, 201, 204, 404, 500, 502, 200] {
            agg.record(record("GET", "/x", status, 1));
        }

        let snap = agg.snapshot();
        assert_eq!(snap.status_code_counts.get(&200), Some(&2));
        assert_eq!(snap.status_code_counts.get(&404), Some(&1));
        assert_eq!(snap.status_code_counts.get(&301), None);

        let classes = snap.status_class_counts();
        assert_eq!(classes.get("2xx"), Some(&4));
        assert_eq!(classes.get("4xx"), Some(&1));
        assert_eq!(classes.get("5xx"), Some(&2));
        assert_eq!(classes.values().sum::<u64>(), snap.total_requests);
    }

    #[test]
    fn malformed_input_is_recorded_as_given() {
        let agg = Aggregator::new();
        agg.record(record("", "", 0, 0));

        let snap = agg.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.status_code_counts.get(&0), Some(&1));
        assert_eq!(snap.routes[0].status_class, "0xx");
        assert_eq!(snap.routes[0].method, "");
    }

    #[test]
    fn routes_use_normalized_labels() {
        let agg = Aggregator::new();
        agg.record(record("GET", "/orders/12345", 200, 3));
        agg.record(record("GET", "/orders/67890?expand=items", 200, 7));
        agg.record(record("GET", "/orders/67890", 404, 1));
        agg.record(record("POST", "/orders", 201, 20));

        let snap = agg.snapshot();
        let routes: Vec<_> = snap
            .routes
            .iter()
            .map(|r| (r.method.as_str(), r.path.as_str(), r.status_class.as_str(), r.count))
            .collect();
        assert_eq!(
            routes,
            [
                ("GET", "/orders/:id", "2xx", 2),
                ("GET", "/orders/:id", "4xx", 1),
                ("POST", "/orders", "2xx", 1),
            ]
        );
    }

    #[test]
    fn custom_normalizer_is_used() {
        let agg = Aggregator::with_normalizer(PathNormalizer::with_static_segments(["tenant42x"]));
        agg.record(record("GET", "/tenant42x/reports", 200, 1));
        assert_eq!(agg.snapshot().routes[0].path, "/tenant42x/reports");
    }

    #[test]
    fn route_buckets_are_cumulative() {
        let agg = Aggregator::new();
        agg.record(record("GET", "/a", 200, 3)); // ≤ 5ms
        agg.record(record("GET", "/a", 200, 40)); // ≤ 50ms
        agg.record(record("GET", "/a", 200, 20_000)); // past the last bound

        let route = &agg.snapshot().routes[0];
        assert_eq!(route.bucket_counts.len(), LATENCY_BUCKETS_SECS.len());
        assert_eq!(route.bucket_counts[0], 1);
        assert_eq!(route.bucket_counts[3], 2);
        assert_eq!(*route.bucket_counts.last().unwrap(), 2);
        assert_eq!(route.count, 3);
    }

    #[test]
    fn snapshot_is_independent_of_later_records() {
        let agg = Aggregator::new();
        agg.record(record("GET", "/a", 200, 1));
        let before = agg.snapshot();

        agg.record(record("GET", "/a", 500, 1));
        assert_eq!(before.total_requests, 1);
        assert_eq!(before.status_code_counts.len(), 1);
        assert_eq!(agg.snapshot().total_requests, 2);
    }

    #[test]
    fn concurrent_records_are_conserved() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1_000;

        let agg = Arc::new(Aggregator::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for i in 0..PER_THREAD {
                        let status = [200, 201, 404, 500][rng.gen_range(0..4)];
                        agg.record(record("GET", &format!("/items/{}", t * PER_THREAD + i), status, 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = agg.snapshot();
        let n = (THREADS * PER_THREAD) as u64;
        assert_eq!(snap.total_requests, n);
        assert_eq!(snap.status_code_counts.values().sum::<u64>(), n);
        assert_eq!(snap.routes.iter().map(|r| r.count).sum::<u64>(), n);
        assert_eq!(snap.latency.count, n);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshots_taken_during_writes_stay_consistent() {
        let agg = Arc::new(Aggregator::new());

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let agg = agg.clone();
                tokio::spawn(async move {
                    for _ in 0..2_000 {
                        agg.record(record("PUT", "/users/550e8400-e29b-41d4-a716-446655440000", 204, 2));
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            let snap = agg.snapshot();
            assert_eq!(snap.status_code_counts.values().sum::<u64>(), snap.total_requests);
            tokio::task::yield_now().await;
        }
        for w in writers {
            w.await.unwrap();
        }

        let snap = agg.snapshot();
        assert_eq!(snap.total_requests, 8_000);
        assert_eq!(snap.routes.len(), 1);
        assert_eq!(snap.routes[0].path, "/users/:uuid");
    }

    #[test]
    fn collect_exposes_labelled_families() {
        let agg = Aggregator::new();
        agg.record(record("GET", "/orders/12345", 200, 30));
        agg.record(record("GET", "/orders/777", 503, 2));

        let metrics = agg.collect().unwrap();
        let names: Vec<_> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "http_requests_total",
                "http_request_duration_seconds",
                "http_responses_by_code_total",
                "http_request_rate",
                "http_request_duration_avg_seconds",
            ]
        );

        let requests = &metrics[0];
        assert_eq!(requests.samples.len(), 2);
        assert!(requests.samples[0]
            .labels
            .contains(&("handler".to_string(), "/orders/:id".to_string())));

        let duration = &metrics[1];
        let per_route = LATENCY_BUCKETS_SECS.len() + 3;
        assert_eq!(duration.samples.len(), 2 * per_route);
        assert!(duration
            .samples
            .iter()
            .any(|s| s.name == "http_request_duration_seconds_bucket"
                && s.labels.contains(&("le".to_string(), "+Inf".to_string()))));

        let by_code = &metrics[2];
        assert_eq!(by_code.samples.len(), 2);
    }

    fn record_lasting(duration: Duration) -> MetricRecord {
        MetricRecord {
            duration,
            ..record("GET", "/a", 200, 0)
        }
    }

    #[test]
    fn saturated_durations_still_average() {
        let agg = Aggregator::new();
        agg.record(record_lasting(Duration::MAX));

        let snap = agg.snapshot();
        assert_eq!(snap.avg_duration(), Duration::MAX);
        assert_eq!(snap.routes[0].avg_duration(), Duration::MAX);

        agg.record(record_lasting(Duration::MAX));
        agg.record(record_lasting(Duration::ZERO));

        let snap = agg.snapshot();
        assert_eq!(snap.total_duration, Duration::MAX);
        assert_eq!(snap.avg_duration().as_secs(), u64::MAX / 3);
        assert_eq!(snap.routes[0].avg_duration().as_secs(), u64::MAX / 3);
        assert_eq!(snap.latency.count, 3);
        assert!(agg.collect().is_ok());
    }

    #[test]
    fn latency_accumulates_across_snapshots() {
        let agg = Aggregator::new();
        for ms in [1, 2, 3] {
            agg.record(record("GET", "/a", 200, ms));
        }
        let first = agg.snapshot();

        agg.record(record("GET", "/a", 200, 4));
        let second = agg.snapshot();
        let third = agg.snapshot();

        assert_eq!(first.latency.count, 3);
        assert_eq!(second.latency.count, 4);
        assert_eq!(third.latency, second.latency);
        assert!((third.latency.max - 4.0).abs() < 0.01);
    }

    #[test]
    fn records_never_wait_on_percentile_extraction() {
        let agg = Aggregator::new();

        // A snapshot computing percentiles holds `merged`; writers never touch it.
        let merged = agg.latency.merged.lock();
        agg.record(record("GET", "/a", 200, 1));
        assert_eq!(agg.totals.read().total_requests, 1);
        drop(merged);

        assert_eq!(agg.snapshot().latency.count, 1);
    }
}
