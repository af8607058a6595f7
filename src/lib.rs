//! # batchq
//!
//! In-process task queue with pluggable persistence.
//!
//! Tasks are merged by identity while they wait, claimed in batches
//! (FIFO, LIFO, or by priority), run through a caller-supplied processor
//! under a concurrency limit, and retried on failure. Every submission
//! gets a [`Ticket`](ticket::Ticket); the queue as a whole reports
//! through a stream of [`Event`](event::Event)s.
//!
//! Stores: in-memory, SQLite and Postgres (via sqlx), or any type
//! implementing [`Store`](store::Store).

pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod ticket;
pub mod worker;

pub use error::{Error, Result};
pub use model::{Failure, Task, TaskId, Verdict};
pub use queue::{Queue, QueueBuilder, QueueStats};
pub use ticket::{Ticket, TicketStatus};
pub use worker::{BatchContext, ProcessInput};
