//! Single-flight store writer.
//!
//! Write descriptors are committed one at a time in the order they were
//! scheduled. A descriptor overwritten while its write was in flight is
//! written again rather than committed. On close, everything not yet
//! committed fails with `store_unavailable`.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};
use uuid::Uuid;

use super::{Inner, admission};
use crate::error::Result;
use crate::event::EventKind;
use crate::model::{Failure, PutOutcome, Task, TaskId};

pub(super) async fn run(inner: Arc<Inner>) {
    let mut closed = inner.closed.subscribe();
    loop {
        if inner.is_closed() {
            break;
        }
        let Some((id, write_id, payload, priority)) = next(&inner) else {
            tokio::select! {
                _ = inner.write_kick.notified() => {}
                _ = super::wait_closed(&mut closed) => break,
            }
            continue;
        };
        let result = inner.store.put_task(&id, &payload, priority).await;
        if let Some(orphan) = commit(&inner, id, write_id, priority, result) {
            // A superseded write created the row, then the final write
            // failed: the row has no tickets left.
            match inner.store.delete_task(&orphan).await {
                Ok(_) => debug!(task_id = %orphan, "orphaned row removed"),
                Err(e) => warn!(task_id = %orphan, "removing orphaned row failed: {e}"),
            }
        }
    }
    fail_unwritten(&inner);
}

/// Fail every ticket still waiting on the pipeline after close: pending
/// writes and committed tasks that will not be admitted any more.
fn fail_unwritten(inner: &Inner) {
    let mut st = inner.lock();
    st.write_queue.clear();
    let writes: Vec<_> = st.writes.drain().collect();
    let groups: Vec<_> = st.groups.drain().collect();
    let dropped = writes.len() + groups.len();
    for (id, desc) in writes {
        inner.reject(&mut st, Some(&id), &desc.tickets, Failure::StoreUnavailable);
    }
    for (id, tickets) in groups {
        st.enqueued_at.remove(&id);
        if !tickets.is_empty() {
            inner.reject(&mut st, Some(&id), &tickets, Failure::StoreUnavailable);
        }
    }
    if dropped > 0 {
        debug!(dropped, "writer closed with unsettled tasks");
    }
}

fn next(inner: &Inner) -> Option<(TaskId, Uuid, Task, f64)> {
    let mut st = inner.lock();
    while let Some(id) = st.write_queue.pop_front() {
        if let Some(desc) = st.writes.get(&id) {
            return Some((id, desc.write_id, desc.payload.clone(), desc.priority));
        }
    }
    None
}

/// Returns the id of a row left behind by a failed write, if any.
fn commit(
    inner: &Arc<Inner>,
    id: TaskId,
    write_id: Uuid,
    priority: f64,
    result: Result<PutOutcome>,
) -> Option<TaskId> {
    let mut admit_now = false;
    let mut orphan = None;
    let mut arm_timer = false;
    {
        let mut st = inner.lock();
        let Some(desc) = st.writes.get_mut(&id) else {
            return None;
        };

        if desc.write_id != write_id {
            if matches!(result, Ok(PutOutcome::Inserted)) {
                desc.inserted = true;
            }
            debug!(task_id = %id, "write superseded, requeueing");
            st.write_queue.push_back(id);
            inner.write_kick.notify_one();
            return None;
        }
        let Some(desc) = st.writes.remove(&id) else {
            return None;
        };

        match result {
            Err(e) => {
                warn!(task_id = %id, "store write failed: {e}");
                if desc.unqueued
                    && let Some(group) = st.groups.get(&id)
                {
                    // The committed value is still in the store.
                    group.queued();
                }
                inner.reject(&mut st, Some(&id), &desc.tickets, Failure::FailedToPutTask);
                if desc.inserted {
                    orphan = Some(id);
                }
            }
            Ok(outcome) => {
                let inserted = outcome == PutOutcome::Inserted || desc.inserted;
                if inserted {
                    st.length += 1;
                    st.notified_empty = false;
                    st.notified_drain = false;
                }
                st.enqueued_at.entry(id.clone()).or_insert_with(Instant::now);
                let group = st.groups.entry(id.clone()).or_default();
                group.append(desc.tickets);
                group.queued();

                inner.metrics.queued(inserted);
                inner.emit(EventKind::TaskQueued {
                    id: id.clone(),
                    priority,
                });
                debug!(task_id = %id, priority, inserted, length = st.length, "task queued");

                if st.length >= inner.options.batch_size || inner.options.batch_delay_ms == 0 {
                    admit_now = true;
                } else if !st.batch_timer_armed {
                    st.batch_timer_armed = true;
                    arm_timer = true;
                }
            }
        }
        if st.take_deferred_admit() {
            admit_now = true;
        }
    }

    if admit_now {
        admission::admit(inner);
    }
    if arm_timer {
        admission::admit_after_batch_delay(inner);
    }
    orphan
}
