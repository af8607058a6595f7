//! Worker state machine tests, driving a single batch directly.

use std::sync::Arc;
use std::time::Duration;

use batchq::model::{Claim, Failure, LockToken, Task, TaskId};
use batchq::worker::{BatchCounts, Processor, Worker, WorkerEvent, WorkerStatus};
use batchq::{BatchContext, ProcessInput};
use serde_json::json;
use tokio::sync::mpsc;

fn claim(ids: &[&str]) -> Claim {
    Claim {
        lock: LockToken::new(),
        tasks: ids
            .iter()
            .map(|id| (TaskId::from(*id), json!({ "id": id })))
            .collect(),
    }
}

fn processor<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(ProcessInput, BatchContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Task>> + Send + 'static,
{
    Arc::new(f)
}

/// Collect events up to and including `End`.
async fn until_end(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let end = matches!(event, WorkerEvent::End { .. });
            events.push(event);
            if end {
                break;
            }
        }
        events
    })
    .await
    .expect("worker did not end in time")
}

fn failures(events: &[WorkerEvent]) -> Vec<(String, Failure)> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::TaskFailed { id, failure } => Some((id.to_string(), failure.clone())),
            _ => None,
        })
        .collect()
}

fn counts(events: &[WorkerEvent]) -> BatchCounts {
    match events.last() {
        Some(WorkerEvent::End { counts }) => *counts,
        other => panic!("expected End last, got {other:?}"),
    }
}

#[tokio::test]
async fn single_task_gets_the_return_value() {
    let (worker, mut rx) = Worker::new(claim(&["a"]), true);
    let handle = worker.handle();
    assert_eq!(handle.status(), WorkerStatus::Ready);

    worker.start(
        processor(|input: ProcessInput, _ctx: BatchContext| async move {
            let task = input.into_single().expect("single input");
            Ok(json!({ "echo": task["id"] }))
        }),
        None,
    );

    let events = until_end(&mut rx).await;
    assert!(matches!(
        &events[0],
        WorkerEvent::TaskFinish { id, result } if id.as_str() == "a" && *result == json!({ "echo": "a" })
    ));
    assert_eq!(
        counts(&events),
        BatchCounts {
            finished: 1,
            failed: 0,
            total: 1
        }
    );
    assert_eq!(handle.status(), WorkerStatus::Finished);
}

#[tokio::test]
async fn batch_input_keeps_claim_order() {
    let (worker, mut rx) = Worker::new(claim(&["a", "b", "c"]), false);
    worker.start(
        processor(|input: ProcessInput, ctx: BatchContext| async move {
            let ids: Vec<String> = input.into_tasks().into_iter().map(|(id, _)| id.0).collect();
            assert_eq!(ids, ["a", "b", "c"]);
            assert_eq!(ctx.task_ids().len(), 3);
            Ok(json!(null))
        }),
        None,
    );
    let events = until_end(&mut rx).await;
    assert_eq!(counts(&events).finished, 3);
}

#[tokio::test]
async fn context_resolution_is_idempotent() {
    let (worker, mut rx) = Worker::new(claim(&["a", "b"]), false);
    worker.start(
        processor(|_input: ProcessInput, ctx: BatchContext| async move {
            let a = TaskId::from("a");
            let b = TaskId::from("b");
            ctx.finish(&a, json!(1));
            ctx.finish(&a, json!(2));
            ctx.failed(&a, "too late");
            ctx.failed(&b, "bad input");
            Ok(json!("ignored"))
        }),
        None,
    );

    let events = until_end(&mut rx).await;
    assert_eq!(events.len(), 3);
    assert!(matches!(
        &events[0],
        WorkerEvent::TaskFinish { result, .. } if *result == json!(1)
    ));
    assert_eq!(
        failures(&events),
        vec![("b".to_string(), Failure::Process("bad input".into()))]
    );
    assert_eq!(
        counts(&events),
        BatchCounts {
            finished: 1,
            failed: 1,
            total: 2
        }
    );
}

#[tokio::test]
async fn progress_ignores_zero_total() {
    let (worker, mut rx) = Worker::new(claim(&["a"]), true);
    worker.start(
        processor(|_input: ProcessInput, ctx: BatchContext| async move {
            let a = TaskId::from("a");
            ctx.progress(&a, 0, 0);
            ctx.progress(&a, 1, 4);
            ctx.progress(&TaskId::from("stranger"), 1, 2);
            Ok(json!("done"))
        }),
        None,
    );

    let events = until_end(&mut rx).await;
    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::TaskProgress { progress, .. } => Some(progress.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].percent, 25.0);
    assert!(progress[0].eta.is_some());
}

#[tokio::test]
async fn processor_error_fails_remaining_tasks() {
    let (worker, mut rx) = Worker::new(claim(&["a", "b"]), false);
    worker.start(
        processor(|_input: ProcessInput, ctx: BatchContext| async move {
            ctx.finish(&TaskId::from("a"), json!("ok"));
            Err(anyhow::anyhow!("upstream down"))
        }),
        None,
    );

    let events = until_end(&mut rx).await;
    assert_eq!(
        failures(&events),
        vec![("b".to_string(), Failure::Process("upstream down".into()))]
    );
}

#[tokio::test]
async fn panics_become_process_exceptions() {
    let (worker, mut rx) = Worker::new(claim(&["a"]), true);
    worker.start(
        processor(|_input: ProcessInput, _ctx: BatchContext| async move {
            if true {
                panic!("boom");
            }
            Ok(json!(null))
        }),
        None,
    );

    let events = until_end(&mut rx).await;
    assert_eq!(
        failures(&events),
        vec![("a".to_string(), Failure::ProcessException("boom".into()))]
    );
}

#[tokio::test]
async fn timeout_fails_every_waiting_task() {
    let (worker, mut rx) = Worker::new(claim(&["a", "b"]), false);
    worker.start(
        processor(|_input: ProcessInput, _ctx: BatchContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!(null))
        }),
        Some(Duration::from_millis(20)),
    );

    let events = until_end(&mut rx).await;
    let failed = failures(&events);
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|(_, f)| *f == Failure::TaskTimeout));
}

#[tokio::test]
async fn cancel_aborts_the_processor() {
    let (worker, mut rx) = Worker::new(claim(&["a"]), true);
    let handle = worker.handle();
    assert!(handle.contains(&TaskId::from("a")));
    worker.start(
        processor(|_input: ProcessInput, _ctx: BatchContext| async move {
            std::future::pending::<()>().await;
            Ok(json!(null))
        }),
        None,
    );
    handle.cancel();

    let events = until_end(&mut rx).await;
    assert_eq!(
        failures(&events),
        vec![("a".to_string(), Failure::Cancelled)]
    );
}

#[tokio::test]
async fn pause_is_visible_to_the_processor() {
    let (worker, mut rx) = Worker::new(claim(&["a"]), true);
    let handle = worker.handle();
    handle.pause();
    worker.start(
        processor(|_input: ProcessInput, ctx: BatchContext| async move {
            let was_paused = ctx.is_paused();
            ctx.wait_while_paused().await;
            Ok(json!(was_paused))
        }),
        None,
    );

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(handle.status(), WorkerStatus::Paused);
    handle.resume();
    assert_eq!(handle.status(), WorkerStatus::InProgress);

    let events = until_end(&mut rx).await;
    assert!(matches!(
        &events[0],
        WorkerEvent::TaskFinish { result, .. } if *result == json!(true)
    ));
}

#[tokio::test]
async fn cancel_task_leaves_batch_mates_running() {
    let (worker, mut rx) = Worker::new(claim(&["a", "b"]), false);
    let handle = worker.handle();
    let gate = Arc::new(tokio::sync::Notify::new());
    let release = Arc::clone(&gate);
    worker.start(
        processor(move |_input: ProcessInput, _ctx: BatchContext| {
            let gate = Arc::clone(&release);
            async move {
                gate.notified().await;
                Ok(json!("done"))
            }
        }),
        None,
    );

    handle.cancel_task(&TaskId::from("a"));
    gate.notify_one();

    let events = until_end(&mut rx).await;
    assert_eq!(
        failures(&events),
        vec![("a".to_string(), Failure::Cancelled)]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        WorkerEvent::TaskFinish { id, result } if id.as_str() == "b" && *result == json!("done")
    )));
    assert_eq!(counts(&events).finished, 1);
}
