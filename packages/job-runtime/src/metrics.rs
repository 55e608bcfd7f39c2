//! Metrics sink seam.
//!
//! The host supplies whatever backend it runs (statsd, prometheus, ...); the
//! runtime only needs counters, gauges, and histograms with a small label
//! set. The default sink forwards to `tracing` at debug level so local runs
//! stay observable without any wiring.

use std::sync::Arc;

use tracing::debug;

pub type Labels<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, value: u64, labels: Labels<'_>);
    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>);
    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Coarse attempt label so cardinality stays bounded.
pub fn attempt_bucket(attempt: i32) -> &'static str {
    match attempt {
        1 => "1",
        2..=3 => "2-3",
        _ => "4+",
    }
}

/// Forwards every observation to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn counter(&self, name: &str, value: u64, labels: Labels<'_>) {
        debug!(metric = name, value, ?labels, "counter");
    }

    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        debug!(metric = name, value, ?labels, "gauge");
    }

    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        debug!(metric = name, value, ?labels, "histogram");
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn counter(&self, _name: &str, _value: u64, _labels: Labels<'_>) {}
    fn gauge(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
    fn histogram(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_buckets_are_coarse() {
        assert_eq!(attempt_bucket(1), "1");
        assert_eq!(attempt_bucket(2), "2-3");
        assert_eq!(attempt_bucket(3), "2-3");
        assert_eq!(attempt_bucket(4), "4+");
        assert_eq!(attempt_bucket(17), "4+");
    }
}
