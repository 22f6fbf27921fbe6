//! Export composition.
//!
//! A [`Registry`] is built once at startup and owns an ordered list of
//! [`MetricSource`]s. [`Registry::collect_all`] asks every source for its
//! metrics in registration order and concatenates them. Collection is
//! fail-fast: the first source error aborts the whole call and no partial
//! list is returned. Callers that want best-effort output must wrap sources
//! individually.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Kind of an exported metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonically increasing counter.
    Counter,
    /// Value that can go up or down.
    Gauge,
    /// Cumulative bucket counts plus `_sum` and `_count`.
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

/// One exported value of a family.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Full sample name; differs from the family name for histogram series
    /// (`_bucket`, `_sum`, `_count`).
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// A metric family as produced by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

impl Metric {
    pub fn new(name: impl Into<String>, help: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            samples: Vec::new(),
        }
    }

    pub fn counter(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(name, help, MetricKind::Counter)
    }

    pub fn gauge(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(name, help, MetricKind::Gauge)
    }

    pub fn histogram(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(name, help, MetricKind::Histogram)
    }

    /// Add a sample named after the family itself.
    pub fn push(&mut self, labels: &[(&str, &str)], value: f64) {
        self.push_suffixed("", labels, value);
    }

    /// Add a sample whose name is the family name plus `suffix`.
    pub fn push_suffixed(&mut self, suffix: &str, labels: &[(&str, &str)], value: f64) {
        self.samples.push(Sample {
            name: format!("{}{}", self.name, suffix),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            value,
        });
    }

    /// Builder form of [`Metric::push`] for single-value families.
    #[must_use]
    pub fn with_value(mut self, value: f64) -> Self {
        self.push(&[], value);
        self
    }
}

/// Failure reported by a single source.
#[derive(Debug, Error)]
#[error("metric source `{collector}` failed: {reason}")]
pub struct CollectError {
    pub collector: String,
    pub reason: String,
}

impl CollectError {
    pub fn new(collector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            collector: collector.into(),
            reason: reason.into(),
        }
    }
}

/// Anything that can contribute metric families to an export.
pub trait MetricSource: Send + Sync {
    /// Stable identifier, used in logs and errors.
    fn name(&self) -> &str;

    fn collect(&self) -> Result<Vec<Metric>, CollectError>;
}

/// Ordered set of metric sources behind one export surface.
#[derive(Default)]
pub struct Registry {
    sources: RwLock<Vec<Arc<dyn MetricSource>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn MetricSource>) {
        let mut sources = self.sources.write();
        if sources.iter().any(|s| s.name() == source.name()) {
            warn!(source = source.name(), "metric source registered twice");
        }
        debug!(source = source.name(), "registered metric source");
        sources.push(source);
    }

    /// Collect from every source in registration order.
    pub fn collect_all(&self) -> Result<Vec<Metric>, CollectError> {
        // Sources run outside the lock so a slow one can't block `register`.
        let sources = self.sources.read().clone();

        let mut all = Vec::new();
        for source in &sources {
            match source.collect() {
                Ok(metrics) => all.extend(metrics),
                Err(e) => {
                    warn!(source = source.name(), error = %e, "metric collection aborted");
                    return Err(e);
                }
            }
        }
        Ok(all)
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
