//! Basic demo using the SQLite storage.
//!
//! This demo shows:
//! - Registering tasks in a registry
//! - Enqueueing jobs into a durable SQLite file
//! - Running a worker that retries a failing task and then dead-letters it
//!
//! Run with: `cargo run -p demo-basic`
//! Set `RUST_LOG=debug` for claim and retry detail.

use serde_json::json;
use std::time::Duration;
use tq_core::{
    Job, RetryPolicy, Storage, TaskArgs, TaskError, TaskRegistry, TaskResult, Worker,
    WorkerConfig,
};
use tq_sqlite::SqliteStorage;
use tracing_subscriber::EnvFilter;

async fn add(args: TaskArgs) -> TaskResult {
    let a: i64 = args.arg(0)?;
    let b: i64 = args.arg(1)?;
    let out = a + b;
    println!("add -> {}", out);
    Ok(json!(out))
}

async fn boom(_args: TaskArgs) -> TaskResult {
    Err(TaskError::new("ValueError", "kaboom"))
}

#[tokio::main]
async fn main() -> tq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("tq job queue demo\n");

    let storage = SqliteStorage::new("tq-demo.db", "demo").await?;

    let registry = TaskRegistry::new();
    registry.register("add", add);
    registry.register("boom", boom);

    let config = WorkerConfig::builder()
        .worker_id("demo-worker")
        .task_timeout(Duration::from_secs(5))
        .retry(RetryPolicy::default().jitter(false))
        .build();
    let worker = Worker::new(storage.clone(), registry, config)?;

    let runner = worker.clone();
    let handle = tokio::spawn(async move { runner.run_forever().await });

    storage.enqueue(Job::new("add").with_args((1, 2))?).await?;
    // Mixed case on purpose: task lookup ignores case.
    storage.enqueue(Job::new("BOOM")).await?;

    // Long enough for boom's three retries (0.5s, 1s, 2s) to play out.
    tokio::time::sleep(Duration::from_millis(4500)).await;

    worker.stop();
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Worker task failed");
    }
    if !worker.join(Duration::from_secs(2)).await {
        tracing::warn!("Some background work was still running at exit");
    }

    let metrics = worker.metrics();
    println!(
        "\ndone; queue size: {}, dead letters: {}",
        storage.size().await?,
        storage.dead_len().await?
    );
    println!(
        "processed: {}, succeeded: {}, retried: {}, dead-lettered: {}",
        metrics.processed, metrics.succeeded, metrics.retried, metrics.dead_lettered
    );

    Ok(())
}
