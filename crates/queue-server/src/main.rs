//! Process entry point: opens the SQLite store, starts worker loops and the
//! orphan reclaimer, serves the HTTP adapter, and coordinates graceful
//! shutdown across all three against one `watch` channel.

use anyhow::Context;
use clap::Parser;
use queue_core::{
    FifoScheduler, HandlerRegistry, LifoScheduler, PriorityScheduler, Scheduler, TaskStore,
    WeightedRandomScheduler, WorkerEngine, WorkerEngineConfig,
};
use queue_sqlite::SqliteStorage;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "queue-server", about = "Durable task queue server")]
struct Config {
    /// Path to the SQLite database file (created if missing).
    #[arg(long, env = "QUEUE_DATABASE_PATH", default_value = "queue.db")]
    database_path: String,

    /// Address the HTTP adapter binds to.
    #[arg(long, env = "QUEUE_BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind_addr: SocketAddr,

    /// Number of in-process worker loops to run.
    #[arg(long, env = "QUEUE_WORKER_COUNT", default_value_t = 2)]
    worker_count: u32,

    /// Scheduling strategy: fifo, lifo, priority, or weighted.
    #[arg(long, env = "QUEUE_SCHEDULER", default_value = "priority")]
    scheduler: SchedulerKind,

    /// Lease duration granted on each claim, in seconds.
    #[arg(long, env = "QUEUE_LEASE_SECONDS", default_value_t = 60)]
    lease_seconds: u64,

    /// Interval between orphan-reclaimer sweeps, in seconds.
    #[arg(long, env = "QUEUE_RECLAIM_INTERVAL_SECONDS", default_value_t = 10)]
    reclaim_interval_seconds: u64,

    /// How long in-flight tasks are given to finish after shutdown is requested.
    #[arg(long, env = "QUEUE_SHUTDOWN_GRACE_SECONDS", default_value_t = 30)]
    shutdown_grace_seconds: u64,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum SchedulerKind {
    Fifo,
    Lifo,
    Priority,
    Weighted,
}

impl SchedulerKind {
    fn build(self) -> Arc<dyn Scheduler> {
        match self {
            SchedulerKind::Fifo => Arc::new(FifoScheduler),
            SchedulerKind::Lifo => Arc::new(LifoScheduler),
            SchedulerKind::Priority => Arc::new(PriorityScheduler),
            SchedulerKind::Weighted => Arc::new(WeightedRandomScheduler::new()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::parse();

    let storage: Arc<dyn TaskStore> = Arc::new(
        SqliteStorage::connect(&config.database_path)
            .await
            .context("open queue database")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let grace = Duration::from_secs(config.shutdown_grace_seconds);

    let mut worker_handles = Vec::new();
    for i in 0..config.worker_count {
        let handlers = HandlerRegistry::new();
        let engine = Arc::new(WorkerEngine::new(
            Arc::clone(&storage),
            config.scheduler.build(),
            handlers,
            WorkerEngineConfig::new(format!("worker-{i}")),
        ));
        worker_handles.push(engine.spawn(shutdown_rx.clone(), grace));
    }

    let reclaimer_handle = queue_core::spawn_reclaimer(
        Arc::clone(&storage),
        Duration::from_secs(config.reclaim_interval_seconds),
        shutdown_rx.clone(),
    );

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind http adapter to {}", config.bind_addr))?;
    let local_addr = listener.local_addr().context("http adapter local_addr")?;
    tracing::info!(event = "server.listening", addr = %local_addr, "http adapter listening");

    let app = queue_http::router(Arc::clone(&storage));
    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        while !*server_shutdown.borrow() {
            if server_shutdown.changed().await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        res = server => {
            if let Err(err) = res {
                tracing::error!(event = "server.http_failed", error = %err, "http adapter exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(event = "server.shutdown_requested", "ctrl-c received");
        }
    }

    shutdown_tx.send(true).ok();
    for handle in worker_handles {
        handle.await.ok();
    }
    reclaimer_handle.await.ok();

    Ok(())
}
