//! Task persistence.
//!
//! A [`Store`] holds unclaimed tasks with their priority and hands out
//! batches atomically: every task is returned by at most one claim.
//! Implementations are built from a [`StoreSpec`] through a
//! [`StoreRegistry`] keyed by kind tag.

pub mod memory;
pub mod sql;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StoreSpec;
use crate::error::{Error, Result};
use crate::model::{Claim, PutOutcome, Task, TaskId};

pub use memory::MemoryStore;
pub use sql::{Dialect, SqlStore};

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Prepare the backend and return the number of unclaimed tasks.
    async fn connect(&self) -> Result<usize>;

    /// The unclaimed task stored under `id`.
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Insert or overwrite the unclaimed task stored under `id`.
    /// Overwrites keep the original insertion position.
    async fn put_task(&self, id: &TaskId, task: &Task, priority: f64) -> Result<PutOutcome>;

    /// Claim up to `n` tasks, highest priority first, oldest first among
    /// equals.
    async fn take_first_n(&self, n: usize) -> Result<Claim>;

    /// Claim up to `n` tasks, highest priority first, newest first among
    /// equals.
    async fn take_last_n(&self, n: usize) -> Result<Claim>;

    /// Remove an unclaimed task. Returns whether one was removed.
    async fn delete_task(&self, id: &TaskId) -> Result<bool>;

    /// Number of unclaimed tasks.
    async fn pending(&self) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

type Factory = Box<dyn Fn(&StoreSpec) -> Result<Arc<dyn Store>> + Send + Sync>;

/// Maps a store kind tag to its constructor.
pub struct StoreRegistry {
    factories: HashMap<String, Factory>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("StoreRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for StoreRegistry {
    /// `memory`, `sqlite` and `postgres`.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", |_| Ok(Arc::new(MemoryStore::new()) as Arc<dyn Store>));
        registry.register("sqlite", |spec| {
            Ok(Arc::new(SqlStore::from_spec(spec, Dialect::Sqlite)?) as Arc<dyn Store>)
        });
        registry.register("postgres", |spec| {
            Ok(Arc::new(SqlStore::from_spec(spec, Dialect::Postgres)?) as Arc<dyn Store>)
        });
        registry
    }
}

impl StoreRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Add or replace the constructor for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&StoreSpec) -> Result<Arc<dyn Store>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn build(&self, spec: &StoreSpec) -> Result<Arc<dyn Store>> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| Error::UnknownStore(spec.kind.clone()))?;
        factory(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_a_typed_error() {
        let spec = StoreSpec {
            kind: "redis".into(),
            ..StoreSpec::default()
        };
        match StoreRegistry::default().build(&spec) {
            Err(Error::UnknownStore(kind)) => assert_eq!(kind, "redis"),
            other => panic!("expected UnknownStore, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn custom_kinds_can_be_registered() {
        let mut registry = StoreRegistry::empty();
        registry.register("scratch", |_| Ok(Arc::new(MemoryStore::new()) as Arc<dyn Store>));
        let spec = StoreSpec {
            kind: "scratch".into(),
            ..StoreSpec::default()
        };
        assert!(registry.build(&spec).is_ok());
    }
}
