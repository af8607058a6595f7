//! Caller-supplied hooks.
//!
//! Every hook is an async trait with a blanket impl for closures, so both
//! `|task| async move { .. }` and hand-written types plug in. Hooks report
//! failures through `anyhow`; the queue maps them to ticket failures.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{Task, TaskId, Verdict};

/// Accept, reject or rewrite raw input before it is queued.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    async fn filter(&self, input: Task) -> anyhow::Result<Verdict>;
}

#[async_trait]
impl<F, Fut> Filter for F
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Verdict>> + Send + 'static,
{
    async fn filter(&self, input: Task) -> anyhow::Result<Verdict> {
        self(input).await
    }
}

/// Combine a new submission with the queued task of the same id.
#[async_trait]
pub trait Merger: Send + Sync + 'static {
    async fn merge(&self, old: Task, new: Task) -> anyhow::Result<Verdict>;
}

#[async_trait]
impl<F, Fut> Merger for F
where
    F: Fn(Task, Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Verdict>> + Send + 'static,
{
    async fn merge(&self, old: Task, new: Task) -> anyhow::Result<Verdict> {
        self(old, new).await
    }
}

/// Ordering weight of a task. Higher is claimed first.
#[async_trait]
pub trait Prioritizer: Send + Sync + 'static {
    async fn priority(&self, task: Task) -> anyhow::Result<f64>;
}

#[async_trait]
impl<F, Fut> Prioritizer for F
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<f64>> + Send + 'static,
{
    async fn priority(&self, task: Task) -> anyhow::Result<f64> {
        self(task).await
    }
}

/// Compute the identity of a task. `None` means the task has no identity.
#[async_trait]
pub trait IdResolver: Send + Sync + 'static {
    async fn resolve(&self, task: Task) -> anyhow::Result<Option<TaskId>>;
}

#[async_trait]
impl<F, Fut> IdResolver for F
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<TaskId>>> + Send + 'static,
{
    async fn resolve(&self, task: Task) -> anyhow::Result<Option<TaskId>> {
        self(task).await
    }
}

/// Gate checked before every claim. Admission waits while it says no.
#[async_trait]
pub trait Precondition: Send + Sync + 'static {
    async fn check(&self) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F, Fut> Precondition for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn check(&self) -> anyhow::Result<bool> {
        self().await
    }
}

/// How a task's identity is derived.
#[derive(Clone, Default)]
pub enum Identity {
    /// The `id` field of a JSON object, else a generated id.
    #[default]
    Auto,
    /// A named field, else a generated id.
    Field(String),
    /// A caller-supplied resolver, else a generated id.
    Resolver(Arc<dyn IdResolver>),
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Auto => f.write_str("Auto"),
            Identity::Field(name) => f.debug_tuple("Field").field(name).finish(),
            Identity::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl Identity {
    pub async fn resolve(&self, task: &Task) -> anyhow::Result<TaskId> {
        let found = match self {
            Identity::Auto => task.get("id").and_then(TaskId::from_value),
            Identity::Field(name) => task.get(name.as_str()).and_then(TaskId::from_value),
            Identity::Resolver(resolver) => resolver.resolve(task.clone()).await?,
        };
        Ok(found.unwrap_or_else(TaskId::generate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn auto_identity_uses_id_field() {
        let id = Identity::Auto.resolve(&json!({"id": 42, "x": 1})).await.unwrap();
        assert_eq!(id, TaskId::from("42"));
    }

    #[tokio::test]
    async fn tasks_without_identity_never_collide() {
        let a = Identity::Auto.resolve(&json!(5)).await.unwrap();
        let b = Identity::Auto.resolve(&json!(5)).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn field_identity() {
        let identity = Identity::Field("key".into());
        let id = identity.resolve(&json!({"key": "abc"})).await.unwrap();
        assert_eq!(id, TaskId::from("abc"));
    }

    #[tokio::test]
    async fn resolver_errors_propagate() {
        let resolver = |_task: Task| async move {
            Err::<Option<TaskId>, _>(anyhow::anyhow!("no identity service"))
        };
        let identity = Identity::Resolver(Arc::new(resolver));
        assert!(identity.resolve(&json!({})).await.is_err());
    }
}
