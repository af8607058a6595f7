//! Metric instrument factories for batchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"batchq"` meter, so they
//! are no-ops until telemetry is initialized with an endpoint.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("batchq")
}

/// Counter: tasks committed to the store.
/// Labels: `outcome` ("inserted" | "updated").
pub fn tasks_queued() -> Counter<u64> {
    meter()
        .u64_counter("batchq.tasks.queued")
        .with_description("Number of task writes committed to the store")
        .build()
}

/// Counter: tasks finalized successfully.
pub fn tasks_finished() -> Counter<u64> {
    meter()
        .u64_counter("batchq.tasks.finished")
        .with_description("Number of tasks finished")
        .build()
}

/// Counter: tasks finalized with a failure.
/// Labels: `reason`.
pub fn tasks_failed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.tasks.failed")
        .with_description("Number of tasks failed")
        .build()
}

/// Counter: retry re-submissions.
pub fn tasks_retried() -> Counter<u64> {
    meter()
        .u64_counter("batchq.tasks.retried")
        .with_description("Number of task retries")
        .build()
}

/// Counter: batches claimed from the store.
pub fn batches_claimed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.batches.claimed")
        .with_description("Number of batches claimed")
        .build()
}

/// Histogram: enqueue-to-finalization latency in milliseconds.
pub fn task_latency_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchq.tasks.latency_ms")
        .with_description("Time from enqueue to finalization")
        .with_unit("ms")
        .build()
}
