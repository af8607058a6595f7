//! In-process store. Tasks live as long as the process.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::Store;
use crate::error::Result;
use crate::model::{Claim, LockToken, Order, PutOutcome, Task, TaskId};

#[derive(Debug)]
struct Row {
    id: TaskId,
    task: Task,
    priority: f64,
    added: u64,
}

#[derive(Debug, Default)]
struct Rows {
    rows: Vec<Row>,
    next_added: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Rows>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Rows> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self, n: usize, order: Order) -> Claim {
        let mut inner = self.lock();
        let rows = &mut inner.rows;
        rows.sort_by(|a, b| {
            b.priority.total_cmp(&a.priority).then(match order {
                Order::Fifo => a.added.cmp(&b.added),
                Order::Filo => b.added.cmp(&a.added),
            })
        });
        let n = n.min(rows.len());
        Claim {
            lock: LockToken::new(),
            tasks: rows.drain(..n).map(|row| (row.id, row.task)).collect(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn connect(&self) -> Result<usize> {
        Ok(self.lock().rows.len())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self
            .lock()
            .rows
            .iter()
            .find(|row| &row.id == id)
            .map(|row| row.task.clone()))
    }

    async fn put_task(&self, id: &TaskId, task: &Task, priority: f64) -> Result<PutOutcome> {
        let mut inner = self.lock();
        if let Some(row) = inner.rows.iter_mut().find(|row| &row.id == id) {
            row.task = task.clone();
            row.priority = priority;
            return Ok(PutOutcome::Updated);
        }
        let added = inner.next_added;
        inner.next_added += 1;
        inner.rows.push(Row {
            id: id.clone(),
            task: task.clone(),
            priority,
            added,
        });
        Ok(PutOutcome::Inserted)
    }

    async fn take_first_n(&self, n: usize) -> Result<Claim> {
        Ok(self.take(n, Order::Fifo))
    }

    async fn take_last_n(&self, n: usize) -> Result<Claim> {
        Ok(self.take(n, Order::Filo))
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.rows.len();
        inner.rows.retain(|row| &row.id != id);
        Ok(inner.rows.len() != before)
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.lock().rows.len())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
