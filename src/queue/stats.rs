//! Queue statistics and metric instruments.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};
use serde::Serialize;

use crate::telemetry::metrics;

/// Outcome counts and enqueue-to-finalization latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueStats {
    /// Finalized tasks, successful or not.
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub average_latency_ms: f64,
    pub peak_latency_ms: f64,
    /// Tasks with a measured latency.
    #[serde(skip)]
    measured: u64,
}

impl QueueStats {
    pub(crate) fn record(&mut self, succeeded: bool, latency: Option<Duration>) {
        self.total += 1;
        if succeeded {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        if let Some(latency) = latency {
            let ms = latency.as_secs_f64() * 1000.0;
            self.measured += 1;
            self.average_latency_ms += (ms - self.average_latency_ms) / self.measured as f64;
            self.peak_latency_ms = self.peak_latency_ms.max(ms);
        }
    }
}

/// OTel instruments, built once per queue.
pub(crate) struct QueueMetrics {
    queued: Counter<u64>,
    finished: Counter<u64>,
    failed: Counter<u64>,
    retried: Counter<u64>,
    claimed: Counter<u64>,
    latency: Histogram<f64>,
}

impl QueueMetrics {
    pub(crate) fn new() -> Self {
        Self {
            queued: metrics::tasks_queued(),
            finished: metrics::tasks_finished(),
            failed: metrics::tasks_failed(),
            retried: metrics::tasks_retried(),
            claimed: metrics::batches_claimed(),
            latency: metrics::task_latency_ms(),
        }
    }

    pub(crate) fn queued(&self, inserted: bool) {
        let outcome = if inserted { "inserted" } else { "updated" };
        self.queued.add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub(crate) fn finished(&self, latency: Option<Duration>) {
        self.finished.add(1, &[]);
        if let Some(latency) = latency {
            self.latency.record(latency.as_secs_f64() * 1000.0, &[]);
        }
    }

    pub(crate) fn failed(&self, reason: &str) {
        self.failed.add(1, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub(crate) fn retried(&self) {
        self.retried.add(1, &[]);
    }

    pub(crate) fn claimed(&self, size: usize) {
        self.claimed
            .add(1, &[KeyValue::new("size", size as i64)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_average_and_peak() {
        let mut stats = QueueStats::default();
        stats.record(true, Some(Duration::from_millis(10)));
        stats.record(false, Some(Duration::from_millis(30)));
        stats.record(true, None);

        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert!((stats.average_latency_ms - 20.0).abs() < 1e-9);
        assert!((stats.peak_latency_ms - 30.0).abs() < 1e-9);
    }
}
