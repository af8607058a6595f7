//! Batch execution.
//!
//! A [`Worker`] owns exactly one claimed batch and runs the caller's
//! [`Processor`] against it once. Outcomes flow back to the queue as
//! [`WorkerEvent`]s over an unbounded channel, so none are dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, warn};
use uuid::Uuid;

use crate::model::{Claim, Failure, Progress, Task, TaskId};
use crate::telemetry::batch::{record_batch_end, start_batch_span};

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// What the processor receives.
#[derive(Debug, Clone)]
pub enum ProcessInput {
    /// Batch size one: the bare task.
    Single { id: TaskId, task: Task },
    /// Every task of the batch, in claim order.
    Batch(Vec<(TaskId, Task)>),
}

impl ProcessInput {
    pub fn len(&self) -> usize {
        match self {
            ProcessInput::Single { .. } => 1,
            ProcessInput::Batch(tasks) => tasks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The task of a single-task input.
    pub fn into_single(self) -> Option<Task> {
        match self {
            ProcessInput::Single { task, .. } => Some(task),
            ProcessInput::Batch(_) => None,
        }
    }

    /// All tasks, whatever the shape.
    pub fn into_tasks(self) -> Vec<(TaskId, Task)> {
        match self {
            ProcessInput::Single { id, task } => vec![(id, task)],
            ProcessInput::Batch(tasks) => tasks,
        }
    }
}

/// The work function.
///
/// The returned value finishes (or the error fails) every task of the
/// batch that was not already resolved through the [`BatchContext`].
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, input: ProcessInput, ctx: BatchContext) -> anyhow::Result<Task>;
}

#[async_trait]
impl<F, Fut> Processor for F
where
    F: Fn(ProcessInput, BatchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Task>> + Send + 'static,
{
    async fn process(&self, input: ProcessInput, ctx: BatchContext) -> anyhow::Result<Task> {
        self(input, ctx).await
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Identifier of one worker, and so of one claimed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub Uuid);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    InProgress,
    Paused,
    Finished,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub finished: usize,
    pub failed: usize,
    pub total: usize,
}

/// Reported to the queue. `End` is always the last event of a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    TaskFinish { id: TaskId, result: Task },
    TaskFailed { id: TaskId, failure: Failure },
    TaskProgress { id: TaskId, progress: Progress },
    End { counts: BatchCounts },
}

struct WorkerState {
    status: WorkerStatus,
    /// Unresolved ids, in claim order.
    waiting: Vec<TaskId>,
    fractions: HashMap<TaskId, f64>,
    counts: BatchCounts,
    started_at: Option<Instant>,
}

struct WorkerShared {
    id: WorkerId,
    order: Vec<TaskId>,
    state: Mutex<WorkerState>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    paused: watch::Sender<bool>,
    cancel: Notify,
    ended: Notify,
}

impl WorkerShared {
    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, event: WorkerEvent) {
        // The queue may already be gone; nothing left to tell then.
        let _ = self.events.send(event);
    }

    fn resolve(&self, id: &TaskId, event: WorkerEvent) {
        let mut state = self.lock();
        if state.status == WorkerStatus::Finished {
            return;
        }
        let Some(pos) = state.waiting.iter().position(|w| w == id) else {
            return;
        };
        state.waiting.remove(pos);
        match &event {
            WorkerEvent::TaskFinish { .. } => state.counts.finished += 1,
            WorkerEvent::TaskFailed { .. } => state.counts.failed += 1,
            _ => {}
        }
        self.send(event);
        if state.waiting.is_empty() {
            self.end(&mut state);
        }
    }

    fn end(&self, state: &mut WorkerState) {
        state.status = WorkerStatus::Finished;
        self.send(WorkerEvent::End {
            counts: state.counts,
        });
        self.ended.notify_one();
    }

    fn finish(&self, id: &TaskId, result: Task) {
        self.resolve(
            id,
            WorkerEvent::TaskFinish {
                id: id.clone(),
                result,
            },
        );
    }

    fn failed(&self, id: &TaskId, failure: Failure) {
        self.resolve(
            id,
            WorkerEvent::TaskFailed {
                id: id.clone(),
                failure,
            },
        );
    }

    fn waiting(&self) -> Vec<TaskId> {
        self.lock().waiting.clone()
    }

    fn finish_remaining(&self, result: Task) {
        for id in self.waiting() {
            self.finish(&id, result.clone());
        }
    }

    fn fail_remaining(&self, failure: Failure) {
        for id in self.waiting() {
            self.failed(&id, failure.clone());
        }
    }

    /// Cancel one task. Its batch-mates keep running; only when it is the
    /// last unresolved task is the processor aborted.
    fn cancel_task(&self, id: &TaskId) {
        let last = {
            let state = self.lock();
            state.waiting.len() == 1 && state.waiting.contains(id)
        };
        if last {
            self.cancel.notify_one();
        } else {
            self.failed(id, Failure::Cancelled);
        }
    }

    fn progress(&self, id: &TaskId, current: u64, total: u64) {
        let mut state = self.lock();
        if !matches!(state.status, WorkerStatus::InProgress | WorkerStatus::Paused) {
            return;
        }
        if !state.waiting.contains(id) {
            return;
        }
        let Some(fraction) = Progress::fraction(current, total) else {
            return;
        };
        state.fractions.insert(id.clone(), fraction);

        let done: f64 = state.fractions.values().sum::<f64>() / self.order.len() as f64;
        let eta = match state.started_at {
            Some(started) if done > 0.0 => {
                let elapsed = started.elapsed().as_secs_f64();
                Some(Duration::from_secs_f64(elapsed * (1.0 - done) / done))
            }
            _ => None,
        };
        self.send(WorkerEvent::TaskProgress {
            id: id.clone(),
            progress: Progress {
                current,
                total,
                percent: fraction * 100.0,
                eta,
            },
        });
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Handed to the processor alongside its input.
#[derive(Clone)]
pub struct BatchContext {
    shared: Arc<WorkerShared>,
}

impl BatchContext {
    pub fn worker_id(&self) -> WorkerId {
        self.shared.id
    }

    /// Ids of the batch in claim order.
    pub fn task_ids(&self) -> &[TaskId] {
        &self.shared.order
    }

    /// Resolve one task successfully. Later calls for the same id are ignored.
    pub fn finish(&self, id: &TaskId, result: Task) {
        self.shared.finish(id, result);
    }

    /// Fail one task. Later calls for the same id are ignored.
    pub fn failed(&self, id: &TaskId, message: impl Into<String>) {
        self.shared.failed(id, Failure::Process(message.into()));
    }

    /// Report progress of one task. A `total` of zero is ignored.
    pub fn progress(&self, id: &TaskId, current: u64, total: u64) {
        self.shared.progress(id, current, total);
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Resolve once the batch is not paused.
    pub async fn wait_while_paused(&self) {
        let mut rx = self.shared.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    /// Pause flag as a watch channel, for processors that select on it.
    pub fn pause_signal(&self) -> watch::Receiver<bool> {
        self.shared.paused.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Control surface of a running worker, held by the queue.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.lock().status
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.shared.order.contains(id)
    }

    /// Abort the processor and fail every waiting task with `cancelled`.
    pub fn cancel(&self) {
        self.shared.cancel.notify_one();
    }

    /// Fail `id` with `cancelled` without touching the rest of the batch.
    pub fn cancel_task(&self, id: &TaskId) {
        self.shared.cancel_task(id);
    }

    pub fn pause(&self) {
        let mut state = self.shared.lock();
        if state.status == WorkerStatus::InProgress {
            state.status = WorkerStatus::Paused;
        }
        self.shared.paused.send_replace(true);
    }

    pub fn resume(&self) {
        let mut state = self.shared.lock();
        if state.status == WorkerStatus::Paused {
            state.status = WorkerStatus::InProgress;
        }
        self.shared.paused.send_replace(false);
    }
}

/// One batch, ready to run.
pub struct Worker {
    shared: Arc<WorkerShared>,
    input: ProcessInput,
}

enum Outcome {
    Finished(Task),
    Failed(Failure),
}

impl Worker {
    /// Build a worker for `claim`. With `single`, the processor gets the
    /// bare task instead of a batch.
    pub fn new(claim: Claim, single: bool) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);
        let order: Vec<TaskId> = claim.ids().cloned().collect();
        let total = order.len();

        let mut tasks = claim.tasks;
        let input = match tasks.pop() {
            Some((id, task)) if single && tasks.is_empty() => ProcessInput::Single { id, task },
            last => {
                tasks.extend(last);
                ProcessInput::Batch(tasks)
            }
        };

        let shared = Arc::new(WorkerShared {
            id: WorkerId(Uuid::new_v4()),
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Ready,
                waiting: order.clone(),
                fractions: HashMap::new(),
                counts: BatchCounts {
                    total,
                    ..BatchCounts::default()
                },
                started_at: None,
            }),
            order,
            events,
            paused,
            cancel: Notify::new(),
            ended: Notify::new(),
        });
        (Self { shared, input }, rx)
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the processor. Resolves every task exactly once: through the
    /// context, the processor's return value, the timeout, cancellation,
    /// or a caught panic.
    pub fn start(self, processor: Arc<dyn Processor>, timeout: Option<Duration>) -> JoinHandle<()> {
        let shared = self.shared;
        {
            let mut state = shared.lock();
            if state.status != WorkerStatus::Ready {
                return tokio::spawn(async {});
            }
            state.status = if *shared.paused.borrow() {
                WorkerStatus::Paused
            } else {
                WorkerStatus::InProgress
            };
            state.started_at = Some(Instant::now());
        }

        let span = start_batch_span(&shared.id.0, self.input.len());
        let ctx = BatchContext {
            shared: Arc::clone(&shared),
        };
        let input = self.input;
        debug!(worker = %shared.id, size = input.len(), "batch started");

        tokio::spawn(
            async move {
                let mut run = tokio::spawn(
                    async move { processor.process(input, ctx).await }.in_current_span(),
                );
                let deadline = async {
                    match timeout {
                        Some(limit) => tokio::time::sleep(limit).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                let outcome = tokio::select! {
                    joined = &mut run => Some(match joined {
                        Ok(Ok(result)) => Outcome::Finished(result),
                        Ok(Err(e)) => Outcome::Failed(Failure::Process(e.to_string())),
                        Err(e) if e.is_panic() => {
                            let message = panic_message(e.into_panic());
                            warn!(worker = %shared.id, %message, "processor panicked");
                            Outcome::Failed(Failure::ProcessException(message))
                        }
                        Err(_) => Outcome::Failed(Failure::Cancelled),
                    }),
                    _ = deadline => {
                        run.abort();
                        warn!(worker = %shared.id, "batch timed out");
                        Some(Outcome::Failed(Failure::TaskTimeout))
                    }
                    _ = shared.cancel.notified() => {
                        run.abort();
                        debug!(worker = %shared.id, "batch cancelled");
                        Some(Outcome::Failed(Failure::Cancelled))
                    }
                    // Every task already resolved through the context; the
                    // processor future is left to finish on its own.
                    _ = shared.ended.notified() => None,
                };

                match outcome {
                    Some(Outcome::Finished(result)) => shared.finish_remaining(result),
                    Some(Outcome::Failed(failure)) => shared.fail_remaining(failure),
                    None => {}
                }
                let counts = shared.lock().counts;
                record_batch_end(&tracing::Span::current(), counts.finished, counts.failed);
            }
            .instrument(span),
        )
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
