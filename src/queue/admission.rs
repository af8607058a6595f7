//! Admission: claim batches, start workers, route their results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ActiveTask, Inner, IntakeMsg, Link, RunningBatch, intake};
use crate::event::EventKind;
use crate::model::{Claim, Failure, Order, Progress, Task, TaskId};
use crate::worker::{Worker, WorkerEvent, WorkerId};

/// Try to start a batch now.
pub(super) fn admit(inner: &Arc<Inner>) {
    tokio::spawn(admit_once(Arc::clone(inner)));
}

/// Try to start a batch after `delay`.
pub(super) fn admit_after(inner: &Arc<Inner>, delay: Duration) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        admit_once(inner).await;
    });
}

/// Retry admission after a refused precondition or a failed claim. At most
/// one retry timer is pending at a time.
fn retry_after(inner: &Arc<Inner>, delay: Duration) {
    {
        let mut st = inner.lock();
        if st.retry_armed {
            return;
        }
        st.retry_armed = true;
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        inner.lock().retry_armed = false;
        admit_once(inner).await;
    });
}

/// The coalesced batch-delay timer.
pub(super) fn admit_after_batch_delay(inner: &Arc<Inner>) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(inner.options.batch_delay()).await;
        inner.lock().batch_timer_armed = false;
        admit_once(inner).await;
    });
}

async fn admit_once(inner: Arc<Inner>) {
    {
        let mut st = inner.lock();
        if inner.is_closed()
            || *inner.link.borrow() != Link::Connected
            || st.paused
            || st.running + st.fetching >= inner.options.concurrent
        {
            return;
        }
        st.fetching += 1;
    }

    if let Some(precondition) = &inner.hooks.precondition {
        let ready = match precondition.check().await {
            Ok(ready) => ready,
            Err(e) => {
                warn!("precondition failed: {e:#}");
                false
            }
        };
        if !ready {
            inner.lock().fetching -= 1;
            debug!("precondition not met, retrying later");
            retry_after(&inner, inner.options.precondition_retry_timeout());
            return;
        }
    }

    let n = inner.options.batch_size;
    let claimed = match inner.options.order {
        Order::Fifo => inner.store.take_first_n(n).await,
        Order::Filo => inner.store.take_last_n(n).await,
    };

    let claim = match claimed {
        Ok(claim) => claim,
        Err(e) => {
            inner.lock().fetching -= 1;
            warn!("claiming a batch failed: {e}");
            inner.emit(EventKind::Error {
                message: format!("failed to claim batch: {e}"),
                fatal: false,
            });
            retry_after(&inner, inner.options.store_retry_timeout());
            return;
        }
    };

    if claim.is_empty() {
        settle_empty(&inner);
        return;
    }
    dispatch(&inner, claim);
    admit(&inner);
}

/// Nothing to claim: announce `empty` and `drain` once per cycle, unless
/// writes are still on their way.
fn settle_empty(inner: &Inner) {
    let mut st = inner.lock();
    st.fetching -= 1;
    if !st.pipeline_idle() {
        st.admit_deferred = true;
        return;
    }
    st.length = 0;
    if !st.notified_empty {
        st.notified_empty = true;
        inner.emit(EventKind::Empty);
    }
    if st.running == 0 && st.fetching == 0 && !st.notified_drain {
        st.notified_drain = true;
        info!("queue drained");
        inner.emit(EventKind::Drain);
    }
}

fn dispatch(inner: &Arc<Inner>, claim: Claim) {
    let size = claim.len();
    let tasks: Vec<(TaskId, Task)> = claim.tasks.clone();
    let (worker, rx) = Worker::new(claim, inner.options.batch_size == 1);
    let handle = worker.handle();
    let worker_id = worker.id();
    {
        let mut st = inner.lock();
        st.fetching -= 1;
        st.running += 1;
        st.length = st.length.saturating_sub(size);

        let mut active = HashMap::with_capacity(size);
        for (id, task) in tasks {
            let tickets = st.groups.remove(&id).unwrap_or_default();
            tickets.started();
            inner.emit(EventKind::TaskStarted { id: id.clone() });
            active.insert(id, ActiveTask { task, tickets });
        }
        if st.paused {
            handle.pause();
        }
        st.batches.insert(
            worker_id,
            RunningBatch {
                handle,
                tasks: active,
            },
        );
    }
    inner.metrics.claimed(size);
    debug!(worker = %worker_id, size, "batch dispatched");

    tokio::spawn(follow(Arc::clone(inner), worker_id, rx));
    worker.start(
        Arc::clone(&inner.hooks.processor),
        inner.options.max_timeout(),
    );
}

/// Route one worker's events until it ends.
async fn follow(inner: Arc<Inner>, worker_id: WorkerId, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::TaskProgress { id, progress } => on_progress(&inner, worker_id, id, progress),
            WorkerEvent::TaskFinish { id, result } => on_finish(&inner, worker_id, id, result),
            WorkerEvent::TaskFailed { id, failure } => on_failed(&inner, worker_id, id, failure),
            WorkerEvent::End { counts } => {
                {
                    let mut st = inner.lock();
                    st.batches.remove(&worker_id);
                    st.running -= 1;
                }
                debug!(
                    worker = %worker_id,
                    finished = counts.finished,
                    failed = counts.failed,
                    "batch ended"
                );
                let delay = inner.options.after_process_delay();
                if delay.is_zero() {
                    admit(&inner);
                } else {
                    admit_after(&inner, delay);
                }
                return;
            }
        }
    }
}

fn on_progress(inner: &Inner, worker_id: WorkerId, id: TaskId, progress: Progress) {
    let st = inner.lock();
    if let Some(active) = st
        .batches
        .get(&worker_id)
        .and_then(|batch| batch.tasks.get(&id))
    {
        active.tickets.progress(&progress);
    }
    inner.emit(EventKind::TaskProgress { id, progress });
}

fn on_finish(inner: &Inner, worker_id: WorkerId, id: TaskId, result: Task) {
    let mut st = inner.lock();
    let Some(active) = st
        .batches
        .get_mut(&worker_id)
        .and_then(|batch| batch.tasks.remove(&id))
    else {
        return;
    };
    st.retries.remove(&id);
    let latency = st.enqueued_at.remove(&id).map(|at| at.elapsed());
    st.stats.record(true, latency);
    active.tickets.finish(&result);
    inner.metrics.finished(latency);
    debug!(task_id = %id, "task finished");
    inner.emit(EventKind::TaskFinish { id, result });
}

/// Retry while the attempt count stays within `max_retries`, otherwise
/// fail the task's tickets for good.
fn on_failed(inner: &Arc<Inner>, worker_id: WorkerId, id: TaskId, failure: Failure) {
    let mut st = inner.lock();
    let Some(active) = st
        .batches
        .get_mut(&worker_id)
        .and_then(|batch| batch.tasks.remove(&id))
    else {
        return;
    };

    let attempt = {
        let count = st.retries.entry(id.clone()).or_insert(0);
        *count += 1;
        *count
    };

    if failure.is_retryable() && attempt <= inner.options.max_retries {
        info!(task_id = %id, attempt, error = %failure, "retrying task");
        inner.metrics.retried();
        inner.emit(EventKind::TaskRetry {
            id: id.clone(),
            attempt,
            error: failure.to_string(),
        });
        // A newer submission of the same id is already on its way: the
        // retry rides along with it instead of overwriting it.
        let superseded = st.writes.contains_key(&id)
            || st.groups.get(&id).is_some_and(|g| !g.is_empty())
            || st.batch_owning(&id).is_some();
        if superseded {
            debug!(task_id = %id, "retry joins newer submission");
            intake::join(&mut st, &id, active.tickets);
            return;
        }
        st.intake_pending += 1;
        drop(st);
        resubmit(inner, id, active, failure);
        return;
    }

    st.retries.remove(&id);
    let latency = st.enqueued_at.remove(&id).map(|at| at.elapsed());
    st.stats.record(false, latency);
    active.tickets.failed(&failure);
    inner.metrics.failed(failure.code());
    warn!(task_id = %id, attempts = attempt, error = %failure, "task failed");
    inner.emit(EventKind::TaskFailed {
        id,
        error: failure.to_string(),
    });
}

fn resubmit(inner: &Arc<Inner>, id: TaskId, active: ActiveTask, failure: Failure) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let delay = inner.options.retry_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let msg = IntakeMsg::Retry {
            id: id.clone(),
            task: active.task,
            tickets: active.tickets.clone(),
        };
        if inner.intake_tx.send(msg).is_err() {
            let mut st = inner.lock();
            st.intake_pending -= 1;
            st.retries.remove(&id);
            inner.reject(&mut st, Some(&id), &active.tickets, failure);
        }
    });
}
