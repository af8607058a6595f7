//! Result handles for submissions.
//!
//! A [`Ticket`] is returned by every `push`. Tickets that end up bound to
//! the same task id are collected in a [`TicketGroup`] and notified
//! together.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};

use crate::event::Emitter;
use crate::model::{Failure, Progress, Task};

const TICKET_EVENT_CAPACITY: usize = 64;

/// Lifecycle state of one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketStatus {
    Created,
    Accepted,
    Queued,
    Started,
    Finished(Task),
    Failed(Failure),
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Finished(_) | TicketStatus::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TicketStatus::Created => "created",
            TicketStatus::Accepted => "accepted",
            TicketStatus::Queued => "queued",
            TicketStatus::Started => "started",
            TicketStatus::Finished(_) => "finished",
            TicketStatus::Failed(_) => "failed",
        }
    }
}

/// Notifications for one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketEvent {
    Accepted,
    Queued,
    Unqueued,
    Started,
    Progress(Progress),
    Finish(Task),
    Failed(Failure),
}

struct TicketInner {
    status: watch::Sender<TicketStatus>,
    progress: Mutex<Option<Progress>>,
    events: Emitter<TicketEvent>,
}

/// Handle on a single `push`. Cheap to clone; clones observe the same
/// submission.
#[derive(Clone)]
pub struct Ticket {
    inner: Arc<TicketInner>,
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("status", &self.status().name())
            .finish()
    }
}

impl Default for Ticket {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticket {
    pub fn new() -> Self {
        let (status, _) = watch::channel(TicketStatus::Created);
        Self {
            inner: Arc::new(TicketInner {
                status,
                progress: Mutex::new(None),
                events: Emitter::new(TICKET_EVENT_CAPACITY),
            }),
        }
    }

    pub fn status(&self) -> TicketStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.status.borrow().is_terminal()
    }

    /// Latest progress report. Only available while the task runs.
    pub fn progress(&self) -> Option<Progress> {
        if *self.inner.status.borrow() != TicketStatus::Started {
            return None;
        }
        self.inner
            .progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.inner.events.subscribe()
    }

    /// Wait for the submission to finish or fail.
    pub async fn wait(&self) -> Result<Task, Failure> {
        let mut rx = self.inner.status.subscribe();
        let status = rx
            .wait_for(TicketStatus::is_terminal)
            .await
            .map(|s| s.clone())
            .unwrap_or(TicketStatus::Failed(Failure::Cancelled));
        match status {
            TicketStatus::Finished(result) => Ok(result),
            TicketStatus::Failed(failure) => Err(failure),
            _ => Err(Failure::Cancelled),
        }
    }

    /// Apply `step` to the status; emit `event` only if it changed.
    fn transition(&self, event: TicketEvent, step: impl FnOnce(&TicketStatus) -> Option<TicketStatus>) {
        let changed = self.inner.status.send_if_modified(|status| match step(status) {
            Some(next) => {
                *status = next;
                true
            }
            None => false,
        });
        if changed {
            self.inner.events.emit(event);
        }
    }

    pub(crate) fn accept(&self) {
        self.transition(TicketEvent::Accepted, |s| {
            matches!(s, TicketStatus::Created).then_some(TicketStatus::Accepted)
        });
    }

    pub(crate) fn queued(&self) {
        self.transition(TicketEvent::Queued, |s| {
            matches!(s, TicketStatus::Accepted | TicketStatus::Started)
                .then_some(TicketStatus::Queued)
        });
    }

    pub(crate) fn unqueued(&self) {
        self.transition(TicketEvent::Unqueued, |s| {
            matches!(s, TicketStatus::Queued).then_some(TicketStatus::Accepted)
        });
    }

    pub(crate) fn started(&self) {
        self.transition(TicketEvent::Started, |s| {
            matches!(s, TicketStatus::Accepted | TicketStatus::Queued)
                .then_some(TicketStatus::Started)
        });
    }

    pub(crate) fn report_progress(&self, progress: Progress) {
        if *self.inner.status.borrow() != TicketStatus::Started {
            return;
        }
        *self
            .inner
            .progress
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(progress.clone());
        self.inner.events.emit(TicketEvent::Progress(progress));
    }

    pub(crate) fn finish(&self, result: Task) {
        let event = TicketEvent::Finish(result.clone());
        self.transition(event, |s| {
            (!s.is_terminal()).then_some(TicketStatus::Finished(result))
        });
    }

    pub(crate) fn failed(&self, failure: Failure) {
        let event = TicketEvent::Failed(failure.clone());
        self.transition(event, |s| {
            (!s.is_terminal()).then_some(TicketStatus::Failed(failure))
        });
    }
}

/// Tickets sharing one task identity.
#[derive(Debug, Clone, Default)]
pub struct TicketGroup {
    tickets: Vec<Ticket>,
}

impl TicketGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(ticket: Ticket) -> Self {
        Self {
            tickets: vec![ticket],
        }
    }

    pub fn push(&mut self, ticket: Ticket) {
        self.tickets.push(ticket);
    }

    /// Move every ticket of `other` to the end of this group.
    pub fn append(&mut self, other: TicketGroup) {
        self.tickets.extend(other.tickets);
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ticket> {
        self.tickets.iter()
    }

    pub(crate) fn accept(&self) {
        self.tickets.iter().for_each(Ticket::accept);
    }

    pub(crate) fn queued(&self) {
        self.tickets.iter().for_each(Ticket::queued);
    }

    pub(crate) fn unqueued(&self) {
        self.tickets.iter().for_each(Ticket::unqueued);
    }

    pub(crate) fn started(&self) {
        self.tickets.iter().for_each(Ticket::started);
    }

    pub(crate) fn progress(&self, progress: &Progress) {
        for ticket in &self.tickets {
            ticket.report_progress(progress.clone());
        }
    }

    pub(crate) fn finish(&self, result: &Task) {
        for ticket in &self.tickets {
            ticket.finish(result.clone());
        }
    }

    pub(crate) fn failed(&self, failure: &Failure) {
        for ticket in &self.tickets {
            ticket.failed(failure.clone());
        }
    }
}
