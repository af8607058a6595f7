//! batchq CLI: run a demo queue or inspect a store.

use std::time::Duration;

use batchq::config::Config;
use batchq::event::EventKind;
use batchq::model::Verdict;
use batchq::store::StoreRegistry;
use batchq::telemetry::{TelemetryConfig, init_telemetry};
use batchq::{ProcessInput, Queue};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(name = "batchq", about = "In-process task queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push tasks through a queue and log its events
    Demo {
        /// Number of pushes
        #[arg(long, default_value_t = 20)]
        tasks: u64,
        /// Distinct task ids; pushes sharing an id are merged
        #[arg(long, default_value_t = 10)]
        distinct: u64,
        /// Store kind (memory, sqlite, postgres)
        #[arg(long)]
        store: Option<String>,
        /// SQLite database file
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        concurrent: Option<usize>,
        /// Simulated work per batch, in milliseconds
        #[arg(long, default_value_t = 50)]
        work_ms: u64,
    },
    /// Print the number of unclaimed tasks in the configured store
    Pending,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Command::Demo {
            tasks,
            distinct,
            store,
            path,
            batch_size,
            concurrent,
            work_ms,
        } => {
            if let Some(kind) = store {
                config.queue.store.kind = kind;
            }
            if path.is_some() {
                config.queue.store.path = path;
            }
            if let Some(n) = batch_size {
                config.queue.batch_size = n;
            }
            if let Some(n) = concurrent {
                config.queue.concurrent = n;
            }
            let _guard = init_telemetry(telemetry(&config))?;
            cmd_demo(config, tasks, distinct.max(1), work_ms).await
        }
        Command::Pending => {
            let _guard = init_telemetry(telemetry(&config))?;
            cmd_pending(config).await
        }
    }
}

fn telemetry(config: &Config) -> TelemetryConfig {
    TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        log_level: config.log_level.clone(),
        ..TelemetryConfig::default()
    }
    .with_queue(&config.queue)
}

async fn cmd_demo(config: Config, tasks: u64, distinct: u64, work_ms: u64) -> anyhow::Result<()> {
    let queue = Queue::builder(move |input: ProcessInput, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(work_ms)).await;
        let total: i64 = input
            .into_tasks()
            .iter()
            .filter_map(|(_, task)| task.get("count").and_then(|c| c.as_i64()))
            .sum();
        Ok(json!({ "count": total }))
    })
    .options(config.queue)
    .merge(|old, new| async move {
        let count = old["count"].as_i64().unwrap_or(0) + new["count"].as_i64().unwrap_or(0);
        Ok(Verdict::Accepted(json!({ "id": new["id"], "count": count })))
    })
    .build()?;
    queue.ready().await?;

    let mut events = queue.subscribe();
    let mut tickets = Vec::with_capacity(tasks as usize);
    for n in 0..tasks {
        tickets.push(queue.push(json!({ "id": n % distinct, "count": 1 })));
    }

    loop {
        let event = events.recv().await?;
        info!(seq = event.seq, event = event.kind.name(), task_id = ?event.kind.task_id(), "event");
        if matches!(event.kind, EventKind::Drain) {
            break;
        }
    }

    let stats = queue.stats();
    println!(
        "finished {} task(s): {} succeeded, {} failed, avg latency {:.1}ms, peak {:.1}ms",
        stats.total,
        stats.succeeded,
        stats.failed,
        stats.average_latency_ms,
        stats.peak_latency_ms
    );
    queue.close().await?;
    Ok(())
}

async fn cmd_pending(config: Config) -> anyhow::Result<()> {
    let store = StoreRegistry::default().build(&config.queue.store)?;
    let count = store.connect().await?;
    println!("{count} unclaimed task(s) in {} store", config.queue.store.kind);
    store.close().await?;
    Ok(())
}
