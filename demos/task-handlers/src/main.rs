//! Echo and sleep task handlers, wired into a running worker engine.
//!
//! Mirrors the `example.echo` / `example.sleep` task types the original
//! worker's test-task generator used to exercise its queue: the echo
//! handler logs `payload.message`, the sleep handler sleeps
//! `payload.duration` seconds while polling for cooperative cancellation.
//! Neither carries scheduling logic of its own — they only exist to give
//! the engine something to run end-to-end.

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use queue_core::{
    FifoScheduler, HandlerContext, HandlerRegistry, NewTask, Scheduler, Task, TaskHandler,
    TaskStore, WorkerEngine, WorkerEngineConfig,
};
use queue_sqlite::SqliteStorage;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the SQLite database file (created if missing).
    #[arg(long, default_value = "queue-demo.db")]
    database: String,

    /// Number of demo tasks to enqueue before starting the worker.
    #[arg(long, default_value_t = 5)]
    seed_tasks: u64,

    /// How long to run before initiating graceful shutdown.
    #[arg(long, default_value_t = 10)]
    run_seconds: u64,
}

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, task: &Task, _ctx: HandlerContext) -> anyhow::Result<()> {
        let message = task
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        tracing::info!(event = "demo.echo", task_id = task.id, message, "echo");
        Ok(())
    }
}

struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn handle(&self, task: &Task, ctx: HandlerContext) -> anyhow::Result<()> {
        let duration_secs = task
            .payload
            .get("duration")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(duration_secs);

        while tokio::time::Instant::now() < deadline {
            if ctx.cancellation.is_cancelled() {
                tracing::info!(
                    event = "demo.sleep.cancelled",
                    task_id = task.id,
                    "sleep handler observed cancellation, stopping early"
                );
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::info!(event = "demo.sleep", task_id = task.id, duration_secs, "slept");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let storage: Arc<dyn TaskStore> = Arc::new(
        SqliteStorage::connect(&args.database)
            .await
            .context("open queue database")?,
    );

    for i in 0..args.seed_tasks {
        let mut echo = NewTask::new("example.echo");
        echo.payload = json!({"message": format!("hello from demo task #{i}")});
        storage.enqueue(echo).await.context("enqueue echo task")?;
    }
    let mut sleep_task = NewTask::new("example.sleep");
    sleep_task.payload = json!({"duration": 2});
    storage
        .enqueue(sleep_task)
        .await
        .context("enqueue sleep task")?;

    let mut handlers: HandlerRegistry = HandlerRegistry::new();
    handlers.insert("example.echo".to_string(), Arc::new(EchoHandler));
    handlers.insert("example.sleep".to_string(), Arc::new(SleepHandler));

    let scheduler: Arc<dyn Scheduler> = Arc::new(FifoScheduler);
    let engine = Arc::new(WorkerEngine::new(
        storage.clone(),
        scheduler,
        handlers,
        WorkerEngineConfig::new("demo-worker-1"),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = engine.spawn(shutdown_rx.clone(), Duration::from_secs(5));
    let reclaimer_handle =
        queue_core::spawn_reclaimer(storage, Duration::from_secs(10), shutdown_rx);

    tracing::info!(
        event = "demo.started",
        run_seconds = args.run_seconds,
        "worker engine running"
    );

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.run_seconds)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    tracing::info!(event = "demo.shutting_down", "shutdown requested");
    shutdown_tx.send(true).ok();
    worker_handle.await.ok();
    reclaimer_handle.await.ok();

    Ok(())
}
