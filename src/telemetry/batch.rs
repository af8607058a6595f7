//! Batch execution span helpers.
//!
//! Every claimed batch runs inside one `batch.execute` span; the outcome
//! counts are recorded on it when the worker settles.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one batch.
///
/// `batch.finished` and `batch.failed` are declared empty and filled in by
/// [`record_batch_end`].
pub fn start_batch_span(worker_id: &Uuid, size: usize) -> Span {
    tracing::info_span!(
        "batch.execute",
        "batch.worker" = %worker_id,
        "batch.size" = size,
        "batch.finished" = tracing::field::Empty,
        "batch.failed" = tracing::field::Empty,
    )
}

/// Record the outcome of a batch on its span.
pub fn record_batch_end(span: &Span, finished: usize, failed: usize) {
    span.record("batch.finished", finished);
    span.record("batch.failed", failed);
    span.in_scope(|| {
        tracing::debug!(finished, failed, "batch_end");
    });
}
