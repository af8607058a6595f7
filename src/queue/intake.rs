//! Submission intake: filter, identity, merge.
//!
//! Messages are handled strictly one after another, so submissions reach
//! the write pipeline in push order. Retries re-enter here too, skipping
//! the filter and identity steps.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Inner, State, WriteDescriptor};
use crate::event::EventKind;
use crate::model::{Failure, Task, TaskId, Verdict};
use crate::ticket::{Ticket, TicketGroup};

pub(super) enum IntakeMsg {
    Push { input: Task, ticket: Ticket },
    Retry { id: TaskId, task: Task, tickets: TicketGroup },
}

pub(super) async fn run(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<IntakeMsg>) {
    let mut closed = inner.closed.subscribe();
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
            _ = super::wait_closed(&mut closed) => break,
        };
        handle(&inner, msg).await;
    }

    // Closed: whatever is still buffered never reaches the store.
    rx.close();
    while let Some(msg) = rx.recv().await {
        let (id, tickets) = match msg {
            IntakeMsg::Push { ticket, .. } => (None, TicketGroup::with(ticket)),
            IntakeMsg::Retry { id, tickets, .. } => (Some(id), tickets),
        };
        let mut st = inner.lock();
        st.intake_pending -= 1;
        inner.reject(&mut st, id.as_ref(), &tickets, Failure::StoreUnavailable);
    }
}

async fn handle(inner: &Arc<Inner>, msg: IntakeMsg) {
    let (id, task, tickets, retry) = match msg {
        IntakeMsg::Push { input, ticket } => {
            let tickets = TicketGroup::with(ticket);
            match identify(inner, input).await {
                Ok((id, task)) => {
                    tickets.accept();
                    inner.emit(EventKind::TaskAccepted { id: id.clone() });
                    (id, task, tickets, false)
                }
                Err((id, failure)) => {
                    finish(inner, |inner, st| {
                        inner.reject(st, id.as_ref(), &tickets, failure)
                    });
                    return;
                }
            }
        }
        IntakeMsg::Retry { id, task, tickets } => (id, task, tickets, true),
    };

    if !inner.wait_connected().await {
        finish(inner, |inner, st| {
            inner.reject(st, Some(&id), &tickets, Failure::StoreUnavailable)
        });
        return;
    }

    if let Err(failure) = enqueue(inner, id.clone(), task, tickets.clone(), retry).await {
        finish(inner, |inner, st| inner.reject(st, Some(&id), &tickets, failure));
    }
}

/// Apply the filter and resolve identity.
async fn identify(inner: &Inner, input: Task) -> Result<(TaskId, Task), (Option<TaskId>, Failure)> {
    let task = match &inner.hooks.filter {
        None => input,
        Some(filter) => match filter.filter(input.clone()).await {
            Ok(Verdict::Accepted(task)) => task,
            Ok(Verdict::Unchanged) => input,
            Ok(Verdict::Rejected(reason)) => {
                debug!(%reason, "input rejected by filter");
                return Err((None, Failure::InputRejected));
            }
            Err(e) => {
                warn!("filter failed: {e:#}");
                return Err((None, Failure::InputRejected));
            }
        },
    };
    match inner.hooks.identity.resolve(&task).await {
        Ok(id) => Ok((id, task)),
        Err(e) => {
            warn!("identity resolution failed: {e:#}");
            Err((None, Failure::IdError))
        }
    }
}

/// Merge `task` with what is queued under `id` and hand the result to the
/// writer.
///
/// A retried task is older than anything queued under its id since it was
/// claimed, so it is merged as the old side and the queued value wins.
async fn enqueue(
    inner: &Arc<Inner>,
    id: TaskId,
    task: Task,
    tickets: TicketGroup,
    retry: bool,
) -> Result<(), Failure> {
    let pending = {
        let st = inner.lock();
        if inner.options.cancel_if_running
            && !retry
            && let Some(batch) = st.batch_owning(&id)
        {
            debug!(task_id = %id, worker = %batch.handle.id(), "cancelling running task");
            batch.handle.cancel_task(&id);
        }
        st.writes.get(&id).map(|desc| desc.payload.clone())
    };

    let (old, from_store) = match pending {
        Some(payload) => (Some(payload), false),
        None => match inner.store.get_task(&id).await {
            Ok(old) => (old, true),
            Err(e) => {
                warn!(task_id = %id, "store read failed: {e}");
                return Err(Failure::FailedToGet);
            }
        },
    };

    let task = match old {
        None => task,
        Some(newer) if retry => match merge(inner, task.clone(), newer).await {
            Ok(merged) => merged.unwrap_or(task),
            Err(e) => {
                warn!(task_id = %id, "merge of retried task failed: {e:#}");
                return Err(Failure::FailedTaskMerge);
            }
        },
        Some(old) => match merge(inner, old, task).await {
            Ok(Some(merged)) => merged,
            Ok(None) => {
                finish(inner, |inner, st| {
                    if inner.is_closed() {
                        inner.reject(st, Some(&id), &tickets, Failure::StoreUnavailable);
                    } else {
                        join(st, &id, tickets);
                    }
                });
                debug!(task_id = %id, "merge kept the queued task");
                return Ok(());
            }
            Err(e) => {
                warn!(task_id = %id, "merge failed: {e:#}");
                return Err(Failure::FailedTaskMerge);
            }
        },
    };

    let priority = match &inner.hooks.prioritizer {
        None => 1.0,
        Some(prioritizer) => match prioritizer.priority(task.clone()).await {
            Ok(priority) if priority.is_finite() => priority,
            Ok(priority) => {
                warn!(task_id = %id, priority, "priority is not a finite number");
                return Err(Failure::FailedToPrioritize);
            }
            Err(e) => {
                warn!(task_id = %id, "priority failed: {e:#}");
                return Err(Failure::FailedToPrioritize);
            }
        },
    };

    let mut scheduled = false;
    finish(inner, |inner, st| {
        // The writer drains on close; nothing scheduled after that is written.
        if inner.is_closed() {
            inner.reject(st, Some(&id), &tickets, Failure::StoreUnavailable);
            return;
        }
        scheduled = true;
        let write_id = Uuid::new_v4();
        match st.writes.get_mut(&id) {
            Some(desc) => {
                desc.write_id = write_id;
                desc.payload = task;
                desc.priority = priority;
                desc.tickets.append(tickets);
            }
            None => {
                // Rewriting a committed task: its tickets wait for the
                // new value.
                let unqueued = from_store && st.groups.get(&id).is_some_and(|g| !g.is_empty());
                if unqueued && let Some(group) = st.groups.get(&id) {
                    group.unqueued();
                }
                st.writes.insert(
                    id.clone(),
                    WriteDescriptor {
                        write_id,
                        payload: task,
                        priority,
                        tickets,
                        inserted: false,
                        unqueued,
                    },
                );
                st.write_queue.push_back(id.clone());
            }
        }
    });
    if scheduled {
        inner.write_kick.notify_one();
        debug!(task_id = %id, priority, "write scheduled");
    }
    Ok(())
}

/// `Ok(None)` means keep the queued task as it is.
async fn merge(inner: &Inner, old: Task, new: Task) -> anyhow::Result<Option<Task>> {
    let Some(merger) = &inner.hooks.merger else {
        return Ok(Some(new));
    };
    match merger.merge(old, new).await? {
        Verdict::Accepted(task) => Ok(Some(task)),
        Verdict::Unchanged => Ok(None),
        Verdict::Rejected(reason) => Err(anyhow::anyhow!("merge rejected: {reason}")),
    }
}

/// Attach tickets to the task already known under `id`.
pub(super) fn join(st: &mut State, id: &TaskId, tickets: TicketGroup) {
    if let Some(desc) = st.writes.get_mut(id) {
        desc.tickets.append(tickets);
    } else if let Some(batch) = st.batch_owning_mut(id) {
        if let Some(active) = batch.tasks.get_mut(id) {
            tickets.started();
            active.tickets.append(tickets);
        }
    } else {
        tickets.queued();
        st.groups.entry(id.clone()).or_default().append(tickets);
    }
}

/// Close out one intake message under the state lock, then run any
/// admission that was waiting for the pipeline to settle.
fn finish(inner: &Arc<Inner>, apply: impl FnOnce(&Inner, &mut State)) {
    let admit = {
        let mut st = inner.lock();
        apply(inner, &mut st);
        st.intake_pending -= 1;
        st.take_deferred_admit()
    };
    if admit {
        super::admission::admit(inner);
    }
}
