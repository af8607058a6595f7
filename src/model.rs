//! Core data model.
//!
//! A task is an opaque JSON value with an identity. The queue never looks
//! inside a payload except to derive that identity.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work as submitted by a caller. Opaque to the queue.
pub type Task = serde_json::Value;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity of a task. Pushes sharing an id are merged while unclaimed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// A fresh identity for tasks that carry none. Never collides, so such
    /// tasks are never merged.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Derive an id from a JSON scalar. Objects, arrays and null carry no
    /// usable identity.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            serde_json::Value::Bool(b) => Some(Self(b.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Claim token written to every row of one claimed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Hook results
// ---------------------------------------------------------------------------

/// Outcome of a `filter` or `merge` hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Use this value.
    Accepted(Task),
    /// Refuse the submission, with a reason.
    Rejected(String),
    /// Keep what is already there: the raw input for a filter, the queued
    /// task for a merge.
    Unchanged,
}

/// Claim order among tasks of equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    /// Oldest first.
    #[default]
    Fifo,
    /// Newest first.
    #[serde(alias = "lifo")]
    Filo,
}

// ---------------------------------------------------------------------------
// Store records
// ---------------------------------------------------------------------------

/// What a store did with a `put_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new unclaimed row was created.
    Inserted,
    /// An existing unclaimed row was overwritten.
    Updated,
}

/// A batch of tasks claimed under one lock token, in claim order.
#[derive(Debug, Clone)]
pub struct Claim {
    pub lock: LockToken,
    pub tasks: Vec<(TaskId, Task)>,
}

impl Claim {
    pub fn empty() -> Self {
        Self {
            lock: LockToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.iter().map(|(id, _)| id)
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// Why a ticket failed. `Display` yields the stable reason code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum Failure {
    InputRejected,
    IdError,
    FailedToGet,
    FailedToPutTask,
    FailedToPrioritize,
    FailedTaskMerge,
    TaskTimeout,
    Cancelled,
    StoreUnavailable,
    /// The processor reported an error.
    Process(String),
    /// The processor panicked.
    ProcessException(String),
}

impl Failure {
    /// Whether this failure consumes a retry attempt. Everything that
    /// happens before a task reaches a worker is final, as is cancellation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Failure::TaskTimeout | Failure::Process(_) | Failure::ProcessException(_)
        )
    }

    /// Low-cardinality reason, safe as a metric label.
    pub fn code(&self) -> &'static str {
        match self {
            Failure::InputRejected => "input_rejected",
            Failure::IdError => "id_error",
            Failure::FailedToGet => "failed_to_get",
            Failure::FailedToPutTask => "failed_to_put_task",
            Failure::FailedToPrioritize => "failed_to_prioritize",
            Failure::FailedTaskMerge => "failed_task_merge",
            Failure::TaskTimeout => "task_timeout",
            Failure::Cancelled => "cancelled",
            Failure::StoreUnavailable => "store_unavailable",
            Failure::Process(_) => "process_error",
            Failure::ProcessException(_) => "process_exception",
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Process(msg) => f.write_str(msg),
            Failure::ProcessException(msg) => write!(f, "process_exception: {msg}"),
            other => f.write_str(other.code()),
        }
    }
}

impl std::error::Error for Failure {}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress of one started task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    /// 0.0 ..= 100.0
    pub percent: f64,
    /// Estimated time left for the whole batch.
    pub eta: Option<Duration>,
}

impl Progress {
    /// Fraction complete, clamped to `0.0..=1.0`. `None` when `total` is
    /// zero and the numbers are not yet meaningful.
    pub fn fraction(current: u64, total: u64) -> Option<f64> {
        if total == 0 {
            return None;
        }
        Some((current as f64 / total as f64).clamp(0.0, 1.0))
    }
}
