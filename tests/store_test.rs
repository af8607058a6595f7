//! Store contract tests, run against every backend.
//!
//! The Postgres case needs a running server:
//!   DATABASE_URL=postgres://... cargo test --test store_test -- --ignored

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use batchq::config::{QueueOptions, StoreSpec};
use batchq::event::EventKind;
use batchq::model::{Claim, Failure, PutOutcome, Task, TaskId};
use batchq::store::{Dialect, MemoryStore, SqlStore, Store};
use batchq::{BatchContext, Error, ProcessInput, Queue};
use secrecy::SecretString;
use serde_json::json;

fn ids(claim: &Claim) -> Vec<&str> {
    claim.ids().map(TaskId::as_str).collect()
}

/// Insert, overwrite, priority ordering, both claim directions, delete.
async fn exercise(store: &dyn Store) {
    assert_eq!(store.connect().await.unwrap(), 0);

    for id in ["a", "b", "c"] {
        let outcome = store
            .put_task(&id.into(), &json!({ "id": id, "v": 1 }), 1.0)
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Inserted);
    }
    let outcome = store
        .put_task(&"b".into(), &json!({ "id": "b", "v": 2 }), 1.0)
        .await
        .unwrap();
    assert_eq!(outcome, PutOutcome::Updated);
    assert_eq!(
        store.get_task(&"b".into()).await.unwrap(),
        Some(json!({ "id": "b", "v": 2 }))
    );
    assert_eq!(store.get_task(&"zz".into()).await.unwrap(), None);

    store
        .put_task(&"d".into(), &json!({ "id": "d" }), 5.0)
        .await
        .unwrap();
    assert_eq!(store.pending().await.unwrap(), 4);

    let first = store.take_first_n(2).await.unwrap();
    assert_eq!(ids(&first), ["d", "a"]);
    assert_eq!(store.get_task(&"a".into()).await.unwrap(), None);

    let last = store.take_last_n(1).await.unwrap();
    assert_eq!(ids(&last), ["c"]);
    assert_eq!(store.pending().await.unwrap(), 1);

    assert!(store.delete_task(&"b".into()).await.unwrap());
    assert!(!store.delete_task(&"b".into()).await.unwrap());
    assert!(store.take_first_n(10).await.unwrap().is_empty());

    store.close().await.unwrap();
}

/// Concurrent claims never hand out the same task twice.
async fn claims_are_disjoint(store: Arc<dyn Store>) {
    store.connect().await.unwrap();
    for n in 0..50 {
        let id = TaskId::from(format!("t{n}"));
        store.put_task(&id, &json!({ "n": n }), 1.0).await.unwrap();
    }

    let takers: Vec<_> = (0..5)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    let claim = store.take_first_n(3).await.unwrap();
                    if claim.is_empty() {
                        return seen;
                    }
                    seen.extend(claim.tasks.into_iter().map(|(id, _)| id));
                }
            })
        })
        .collect();

    let mut all = Vec::new();
    for taker in takers {
        all.extend(taker.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(unique.len(), 50);
    store.close().await.unwrap();
}

fn sqlite_memory() -> SqlStore {
    SqlStore::new(SecretString::from("sqlite::memory:"), Dialect::Sqlite, "tasks").unwrap()
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_store_contract() {
    exercise(&MemoryStore::new()).await;
}

#[tokio::test]
async fn memory_store_claims_are_disjoint() {
    claims_are_disjoint(Arc::new(MemoryStore::new())).await;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sqlite_store_contract() {
    exercise(&sqlite_memory()).await;
}

#[tokio::test]
async fn sqlite_store_claims_are_disjoint() {
    claims_are_disjoint(Arc::new(sqlite_memory())).await;
}

#[tokio::test]
async fn sqlite_store_requires_connect() {
    let store = sqlite_memory();
    assert!(matches!(store.pending().await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn sqlite_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let spec = StoreSpec::sqlite(path.to_str());

    let store = SqlStore::from_spec(&spec, Dialect::Sqlite).unwrap();
    store.connect().await.unwrap();
    store.put_task(&"x".into(), &json!({ "id": "x" }), 1.0).await.unwrap();
    store.put_task(&"y".into(), &json!({ "id": "y" }), 2.0).await.unwrap();
    store.close().await.unwrap();

    let reopened = SqlStore::from_spec(&spec, Dialect::Sqlite).unwrap();
    assert_eq!(reopened.connect().await.unwrap(), 2);
    let claim = reopened.take_first_n(5).await.unwrap();
    assert_eq!(ids(&claim), ["y", "x"]);
    reopened.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

fn postgres_store() -> SqlStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let table = format!("batchq_test_{}", uuid::Uuid::new_v4().simple());
    SqlStore::new(SecretString::from(url), Dialect::Postgres, table).unwrap()
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn postgres_store_contract() {
    exercise(&postgres_store()).await;
}

#[tokio::test]
#[ignore] // Requires running Postgres
async fn postgres_store_claims_are_disjoint() {
    claims_are_disjoint(Arc::new(postgres_store())).await;
}

// ---------------------------------------------------------------------------
// Connection failures
// ---------------------------------------------------------------------------

/// A store whose first `failures` connects fail.
struct Flaky {
    inner: MemoryStore,
    attempts: AtomicU32,
    failures: u32,
}

impl Flaky {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            attempts: AtomicU32::new(0),
            failures,
        }
    }
}

#[async_trait]
impl Store for Flaky {
    async fn connect(&self) -> batchq::Result<usize> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(Error::Other("connection refused".into()));
        }
        self.inner.connect().await
    }

    async fn get_task(&self, id: &TaskId) -> batchq::Result<Option<Task>> {
        self.inner.get_task(id).await
    }

    async fn put_task(&self, id: &TaskId, task: &Task, priority: f64) -> batchq::Result<PutOutcome> {
        self.inner.put_task(id, task, priority).await
    }

    async fn take_first_n(&self, n: usize) -> batchq::Result<Claim> {
        self.inner.take_first_n(n).await
    }

    async fn take_last_n(&self, n: usize) -> batchq::Result<Claim> {
        self.inner.take_last_n(n).await
    }

    async fn delete_task(&self, id: &TaskId) -> batchq::Result<bool> {
        self.inner.delete_task(id).await
    }

    async fn pending(&self) -> batchq::Result<usize> {
        self.inner.pending().await
    }

    async fn close(&self) -> batchq::Result<()> {
        self.inner.close().await
    }
}

fn quick_retries() -> QueueOptions {
    QueueOptions {
        store_max_retries: 2,
        store_retry_timeout_ms: 10,
        ..QueueOptions::default()
    }
}

fn echo(input: ProcessInput, _ctx: BatchContext) -> impl std::future::Future<Output = anyhow::Result<Task>> {
    async move { Ok(input.into_single().unwrap_or_default()) }
}

#[tokio::test]
async fn unreachable_store_fails_submissions() {
    let store = Arc::new(Flaky::new(u32::MAX));
    let queue = Queue::builder(echo)
        .options(quick_retries())
        .store(store.clone())
        .build()
        .unwrap();
    let mut events = queue.subscribe();

    let ticket = queue.push(json!({ "id": "lost" }));
    let result = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
        .await
        .unwrap();
    assert_eq!(result, Err(Failure::StoreUnavailable));
    assert!(matches!(queue.ready().await, Err(Error::NotConnected)));
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);

    let fatal = loop {
        let event = events.recv().await.unwrap();
        if let EventKind::Error { fatal, .. } = event.kind {
            break fatal;
        }
    };
    assert!(fatal);
}

#[tokio::test]
async fn store_connection_is_retried() {
    let store = Arc::new(Flaky::new(2));
    let queue = Queue::builder(echo)
        .options(quick_retries())
        .store(store.clone())
        .build()
        .unwrap();

    let ticket = queue.push(json!({ "id": "kept" }));
    queue.ready().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
        .await
        .unwrap();
    assert_eq!(result, Ok(json!({ "id": "kept" })));
    assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Write pipeline
// ---------------------------------------------------------------------------

/// A memory store whose writes take `delay` and fail after the first
/// `good_puts`.
struct SlowWrites {
    inner: MemoryStore,
    delay: Duration,
    good_puts: u32,
    puts: AtomicU32,
}

impl SlowWrites {
    fn new(delay: Duration, good_puts: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            good_puts,
            puts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Store for SlowWrites {
    async fn connect(&self) -> batchq::Result<usize> {
        self.inner.connect().await
    }

    async fn get_task(&self, id: &TaskId) -> batchq::Result<Option<Task>> {
        self.inner.get_task(id).await
    }

    async fn put_task(&self, id: &TaskId, task: &Task, priority: f64) -> batchq::Result<PutOutcome> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if n >= self.good_puts {
            return Err(Error::Other("disk full".into()));
        }
        self.inner.put_task(id, task, priority).await
    }

    async fn take_first_n(&self, n: usize) -> batchq::Result<Claim> {
        self.inner.take_first_n(n).await
    }

    async fn take_last_n(&self, n: usize) -> batchq::Result<Claim> {
        self.inner.take_last_n(n).await
    }

    async fn delete_task(&self, id: &TaskId) -> batchq::Result<bool> {
        self.inner.delete_task(id).await
    }

    async fn pending(&self) -> batchq::Result<usize> {
        self.inner.pending().await
    }

    async fn close(&self) -> batchq::Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn close_fails_unwritten_tasks() {
    let store = Arc::new(SlowWrites::new(Duration::from_millis(50), u32::MAX));
    let queue = Queue::builder(echo).store(store.clone()).build().unwrap();
    queue.ready().await.unwrap();

    let tickets: Vec<_> = (0..5)
        .map(|n| queue.push(json!({ "id": format!("t{n}") })))
        .collect();
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.close().await.unwrap();

    let mut unavailable = 0;
    for (n, ticket) in tickets.iter().enumerate() {
        let result = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
            .await
            .expect("ticket left hanging after close");
        match result {
            Err(Failure::StoreUnavailable) => unavailable += 1,
            other => assert_eq!(other, Ok(json!({ "id": format!("t{n}") }))),
        }
    }
    assert!(unavailable >= 3, "only {unavailable} tickets failed");
}

#[tokio::test]
async fn failed_rewrite_removes_orphaned_row() {
    let store = Arc::new(SlowWrites::new(Duration::from_millis(30), 1));
    let queue = Queue::builder(echo).store(store.clone()).build().unwrap();
    queue.ready().await.unwrap();
    queue.pause();

    let first = queue.push(json!({ "id": "x", "v": 1 }));
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.puts.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    let second = queue.push(json!({ "id": "x", "v": 2 }));

    for ticket in [&first, &second] {
        let result = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
            .await
            .unwrap();
        assert_eq!(result, Err(Failure::FailedToPutTask));
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.inner.pending().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("orphaned row was not removed");
    assert_eq!(store.puts.load(Ordering::SeqCst), 2);
    assert_eq!(queue.length(), 0);
}
