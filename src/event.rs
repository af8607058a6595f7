//! Structured events emitted by the queue on every lifecycle step.
//!
//! Each component owns its own [`Emitter`]; consumers subscribe to the
//! stream they care about. Events are the queue's voice, tickets carry
//! the voice of a single submission.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{Progress, Task, TaskId};

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CAPACITY: usize = 4096;

/// Broadcast dispatcher. Emitting with no subscribers is not an error.
#[derive(Debug)]
pub struct Emitter<E: Clone> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> Emitter<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }
}

impl<E: Clone> Default for Emitter<E> {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

/// A structured event emitted by a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskAccepted {
        id: TaskId,
    },
    TaskQueued {
        id: TaskId,
        priority: f64,
    },
    TaskStarted {
        id: TaskId,
    },
    TaskProgress {
        id: TaskId,
        progress: Progress,
    },
    TaskFinish {
        id: TaskId,
        result: Task,
    },
    TaskFailed {
        id: TaskId,
        error: String,
    },
    TaskRetry {
        id: TaskId,
        attempt: u32,
        error: String,
    },
    Empty,
    Drain,
    Error {
        message: String,
        fatal: bool,
    },
}

impl EventKind {
    /// The snake_case name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskAccepted { .. } => "task_accepted",
            EventKind::TaskQueued { .. } => "task_queued",
            EventKind::TaskStarted { .. } => "task_started",
            EventKind::TaskProgress { .. } => "task_progress",
            EventKind::TaskFinish { .. } => "task_finish",
            EventKind::TaskFailed { .. } => "task_failed",
            EventKind::TaskRetry { .. } => "task_retry",
            EventKind::Empty => "empty",
            EventKind::Drain => "drain",
            EventKind::Error { .. } => "error",
        }
    }

    /// The task this event is about, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            EventKind::TaskAccepted { id }
            | EventKind::TaskQueued { id, .. }
            | EventKind::TaskStarted { id }
            | EventKind::TaskProgress { id, .. }
            | EventKind::TaskFinish { id, .. }
            | EventKind::TaskFailed { id, .. }
            | EventKind::TaskRetry { id, .. } => Some(id),
            EventKind::Empty | EventKind::Drain | EventKind::Error { .. } => None,
        }
    }
}

/// Queue-level emitter that stamps sequence numbers and timestamps.
#[derive(Debug, Default)]
pub struct EventLog {
    seq: AtomicU64,
    emitter: Emitter<Event>,
}

impl EventLog {
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.emitter.subscribe()
    }

    pub fn record(&self, kind: EventKind) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.emitter.emit(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}
