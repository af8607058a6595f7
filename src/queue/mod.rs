//! The queue orchestrator.
//!
//! A [`Queue`] is a set of cooperating tokio tasks around one state
//! mutex:
//!
//! - the **intake** loop filters, identifies and merges submissions in the
//!   order they were pushed ([`intake`]);
//! - the **writer** loop commits write descriptors to the store one at a
//!   time ([`writer`]);
//! - **admission** claims batches and hands them to workers, and one
//!   listener per worker routes results back to tickets ([`admission`]).
//!
//! The mutex is never held across an `.await`.

mod admission;
mod intake;
mod stats;
mod writer;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{Notify, broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueOptions;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventLog};
use crate::hooks::{Filter, IdResolver, Identity, Merger, Precondition, Prioritizer};
use crate::model::{Failure, Task, TaskId, Verdict};
use crate::store::{Store, StoreRegistry};
use crate::ticket::{Ticket, TicketGroup};
use crate::worker::{BatchContext, ProcessInput, Processor, WorkerHandle, WorkerId};

pub use stats::QueueStats;

use intake::IntakeMsg;
use stats::QueueMetrics;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Store connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Connecting,
    Connected,
    Failed,
}

/// A pending store write for one task id.
struct WriteDescriptor {
    /// Replaced on every overwrite; a stale id after a write means the
    /// write was superseded.
    write_id: Uuid,
    payload: Task,
    priority: f64,
    tickets: TicketGroup,
    /// A superseded write of this descriptor created the row.
    inserted: bool,
    /// The committed task's group was unqueued for this rewrite.
    unqueued: bool,
}

struct ActiveTask {
    task: Task,
    tickets: TicketGroup,
}

struct RunningBatch {
    handle: WorkerHandle,
    tasks: HashMap<TaskId, ActiveTask>,
}

#[derive(Default)]
struct State {
    paused: bool,
    /// Tracked count of unclaimed tasks in the store.
    length: usize,
    running: usize,
    fetching: usize,
    /// Submissions and retries not yet handed to the writer.
    intake_pending: usize,
    writes: HashMap<TaskId, WriteDescriptor>,
    write_queue: VecDeque<TaskId>,
    groups: HashMap<TaskId, TicketGroup>,
    batches: HashMap<WorkerId, RunningBatch>,
    retries: HashMap<TaskId, u32>,
    enqueued_at: HashMap<TaskId, Instant>,
    batch_timer_armed: bool,
    retry_armed: bool,
    admit_deferred: bool,
    notified_empty: bool,
    notified_drain: bool,
    stats: QueueStats,
}

impl State {
    fn pipeline_idle(&self) -> bool {
        self.intake_pending == 0 && self.writes.is_empty()
    }

    /// Whether a deferred admission should run now. Clears the flag.
    fn take_deferred_admit(&mut self) -> bool {
        if self.admit_deferred && self.pipeline_idle() {
            self.admit_deferred = false;
            true
        } else {
            false
        }
    }

    fn batch_owning(&self, id: &TaskId) -> Option<&RunningBatch> {
        self.batches.values().find(|b| b.tasks.contains_key(id))
    }

    fn batch_owning_mut(&mut self, id: &TaskId) -> Option<&mut RunningBatch> {
        self.batches.values_mut().find(|b| b.tasks.contains_key(id))
    }
}

struct Hooks {
    processor: Arc<dyn Processor>,
    filter: Option<Arc<dyn Filter>>,
    merger: Option<Arc<dyn Merger>>,
    prioritizer: Option<Arc<dyn Prioritizer>>,
    identity: Identity,
    precondition: Option<Arc<dyn Precondition>>,
}

struct Inner {
    options: QueueOptions,
    hooks: Hooks,
    store: Arc<dyn Store>,
    state: Mutex<State>,
    events: EventLog,
    metrics: QueueMetrics,
    link: watch::Sender<Link>,
    closed: watch::Sender<bool>,
    write_kick: Notify,
    intake_tx: mpsc::UnboundedSender<IntakeMsg>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, kind: EventKind) {
        self.events.record(kind);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Fail tickets before they reached a worker.
    fn reject(&self, st: &mut State, id: Option<&TaskId>, tickets: &TicketGroup, failure: Failure) {
        debug!(task_id = ?id.map(TaskId::as_str), reason = failure.code(), "submission failed");
        tickets.failed(&failure);
        self.metrics.failed(failure.code());
        st.stats.record(false, None);
        if let Some(id) = id {
            self.emit(EventKind::TaskFailed {
                id: id.clone(),
                error: failure.to_string(),
            });
        }
    }

    /// Resolve once the store is connected. `false` if it never will be.
    async fn wait_connected(&self) -> bool {
        let mut rx = self.link.subscribe();
        match rx.wait_for(|link| *link != Link::Connecting).await {
            Ok(link) => *link == Link::Connected,
            Err(_) => false,
        }
    }
}

/// Resolve once the queue is closed.
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Connect the store, retrying with a fixed backoff.
async fn connect_store(inner: Arc<Inner>) {
    let mut attempt = 0u32;
    loop {
        match inner.store.connect().await {
            Ok(count) => {
                inner.lock().length = count;
                inner.link.send_replace(Link::Connected);
                info!(pending = count, "queue connected to store");
                if inner.options.auto_resume && count > 0 {
                    admission::admit(&inner);
                }
                return;
            }
            Err(e) => {
                attempt += 1;
                if attempt > inner.options.store_max_retries {
                    error!(attempts = attempt, "store connection failed: {e}");
                    inner.emit(EventKind::Error {
                        message: format!("store connection failed: {e}"),
                        fatal: true,
                    });
                    inner.link.send_replace(Link::Failed);
                    return;
                }
                warn!(attempt, "store connection failed, retrying: {e}");
                tokio::time::sleep(inner.options.store_retry_timeout()).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and starts a [`Queue`].
pub struct QueueBuilder {
    options: QueueOptions,
    hooks: Hooks,
    store: Option<Arc<dyn Store>>,
    registry: Option<StoreRegistry>,
}

impl QueueBuilder {
    fn new(processor: Arc<dyn Processor>) -> Self {
        Self {
            options: QueueOptions::default(),
            hooks: Hooks {
                processor,
                filter: None,
                merger: None,
                prioritizer: None,
                identity: Identity::Auto,
                precondition: None,
            },
            store: None,
            registry: None,
        }
    }

    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    pub fn filter<F, Fut>(mut self, filter: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Verdict>> + Send + 'static,
    {
        self.hooks.filter = Some(Arc::new(filter));
        self
    }

    pub fn merge<F, Fut>(mut self, merge: F) -> Self
    where
        F: Fn(Task, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Verdict>> + Send + 'static,
    {
        self.hooks.merger = Some(Arc::new(merge));
        self
    }

    pub fn priority<F, Fut>(mut self, priority: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<f64>> + Send + 'static,
    {
        self.hooks.prioritizer = Some(Arc::new(priority));
        self
    }

    pub fn precondition<F, Fut>(mut self, precondition: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.hooks.precondition = Some(Arc::new(precondition));
        self
    }

    /// Derive identity from a named field instead of `id`.
    pub fn id_field(mut self, name: impl Into<String>) -> Self {
        self.hooks.identity = Identity::Field(name.into());
        self
    }

    pub fn id_resolver<F, Fut>(mut self, resolver: F) -> Self
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<TaskId>>> + Send + 'static,
    {
        self.hooks.identity = Identity::Resolver(Arc::new(resolver));
        self
    }

    /// Hook implementations that are not closures.
    pub fn filter_with(mut self, filter: Arc<dyn Filter>) -> Self {
        self.hooks.filter = Some(filter);
        self
    }

    pub fn merge_with(mut self, merger: Arc<dyn Merger>) -> Self {
        self.hooks.merger = Some(merger);
        self
    }

    pub fn priority_with(mut self, prioritizer: Arc<dyn Prioritizer>) -> Self {
        self.hooks.prioritizer = Some(prioritizer);
        self
    }

    pub fn id_resolver_with(mut self, resolver: Arc<dyn IdResolver>) -> Self {
        self.hooks.identity = Identity::Resolver(resolver);
        self
    }

    pub fn precondition_with(mut self, precondition: Arc<dyn Precondition>) -> Self {
        self.hooks.precondition = Some(precondition);
        self
    }

    /// Use this store instead of building one from `options.store`.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registry used to build the store from `options.store`.
    pub fn registry(mut self, registry: StoreRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Start the queue. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Queue> {
        self.options.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::Other(
                "a queue must be built inside a tokio runtime".into(),
            ));
        }
        let store = match self.store {
            Some(store) => store,
            None => self
                .registry
                .unwrap_or_default()
                .build(&self.options.store)?,
        };

        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (link, _) = watch::channel(Link::Connecting);
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            options: self.options,
            hooks: self.hooks,
            store,
            state: Mutex::new(State::default()),
            events: EventLog::default(),
            metrics: QueueMetrics::new(),
            link,
            closed,
            write_kick: Notify::new(),
            intake_tx,
        });

        tokio::spawn(intake::run(Arc::clone(&inner), intake_rx));
        tokio::spawn(writer::run(Arc::clone(&inner)));
        tokio::spawn(connect_store(Arc::clone(&inner)));

        info!(
            batch_size = inner.options.batch_size,
            concurrent = inner.options.concurrent,
            order = ?inner.options.order,
            "queue started"
        );
        Ok(Queue { inner })
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Handle on a running queue. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.lock();
        f.debug_struct("Queue")
            .field("length", &st.length)
            .field("running", &st.running)
            .field("paused", &st.paused)
            .finish()
    }
}

impl Queue {
    /// Start configuring a queue around a processing closure.
    pub fn builder<F, Fut>(process: F) -> QueueBuilder
    where
        F: Fn(ProcessInput, BatchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Task>> + Send + 'static,
    {
        QueueBuilder::new(Arc::new(process))
    }

    /// Start configuring a queue around a [`Processor`] implementation.
    pub fn with_processor(processor: Arc<dyn Processor>) -> QueueBuilder {
        QueueBuilder::new(processor)
    }

    /// Submit a task. Returns at once; the ticket reports what happens.
    pub fn push(&self, input: Task) -> Ticket {
        let ticket = Ticket::new();
        self.inner.lock().intake_pending += 1;
        let msg = IntakeMsg::Push {
            input,
            ticket: ticket.clone(),
        };
        if self.inner.intake_tx.send(msg).is_err() {
            let mut st = self.inner.lock();
            st.intake_pending -= 1;
            self.inner.reject(
                &mut st,
                None,
                &TicketGroup::with(ticket.clone()),
                Failure::StoreUnavailable,
            );
        }
        ticket
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Wait for the store connection. Errors if it failed for good.
    pub async fn ready(&self) -> Result<()> {
        if self.inner.wait_connected().await {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Stop admitting batches and pause running ones.
    pub fn pause(&self) {
        let mut st = self.inner.lock();
        st.paused = true;
        for batch in st.batches.values() {
            batch.handle.pause();
        }
        info!("queue paused");
    }

    pub fn resume(&self) {
        {
            let mut st = self.inner.lock();
            st.paused = false;
            for batch in st.batches.values() {
                batch.handle.resume();
            }
        }
        info!("queue resumed");
        admission::admit(&self.inner);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Tracked number of unclaimed tasks.
    pub fn length(&self) -> usize {
        self.inner.lock().length
    }

    /// Batches in flight.
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats
    }

    /// Cancel `id` in the batch running it, or remove `id` from the store.
    /// Either way its tickets fail with `cancelled`; batch-mates keep
    /// running. Returns whether anything was cancelled.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool> {
        if let Some(batch) = self.inner.lock().batch_owning(id) {
            batch.handle.cancel_task(id);
            return Ok(true);
        }
        let removed = self.inner.store.delete_task(id).await?;
        if removed {
            let mut st = self.inner.lock();
            st.length = st.length.saturating_sub(1);
            st.retries.remove(id);
            st.enqueued_at.remove(id);
            let tickets = st.groups.remove(id).unwrap_or_default();
            self.inner
                .reject(&mut st, Some(id), &tickets, Failure::Cancelled);
            info!(task_id = %id, "queued task cancelled");
        }
        Ok(removed)
    }

    /// Stop admission, fail buffered submissions and close the store.
    /// Batches already running finish on their own.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.send_replace(true) {
            return Ok(());
        }
        self.inner.write_kick.notify_one();
        self.inner.store.close().await?;
        info!("queue closed");
        Ok(())
    }
}
