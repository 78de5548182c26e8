//! The worker engine: one long-running loop per worker, plus the orphan
//! reclaimer. Spec §4.5.

use crate::backoff::compute_delay;
use crate::error::QueueError;
use crate::handler::{CancellationToken, HandlerContext, HandlerRegistry};
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::task::Task;
use crate::worker::WorkerStatus;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct WorkerEngineConfig {
    pub worker_id: String,
    pub capabilities: Value,
    pub lease_duration: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Bound on pick+claim cycles per outer loop iteration before giving up
    /// and sleeping. Spec §4.3 names `K=3` for weighted-random specifically;
    /// this engine applies the same bound uniformly (see DESIGN.md).
    pub max_claim_attempts: usize,
    /// Bound on retries of `mark_succeeded`/`mark_failed` against transient
    /// storage errors (spec §4.5 "Failure semantics").
    pub finalize_max_attempts: usize,
}

impl WorkerEngineConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            capabilities: Value::Object(Default::default()),
            lease_duration: Duration::from_secs(60),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
            max_claim_attempts: 3,
            finalize_max_attempts: 3,
        }
    }
}

pub struct WorkerEngine {
    store: Arc<dyn TaskStore>,
    scheduler: Arc<dyn Scheduler>,
    handlers: HandlerRegistry,
    config: WorkerEngineConfig,
    claim_rng: std::sync::Mutex<fastrand::Rng>,
}

impl WorkerEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        scheduler: Arc<dyn Scheduler>,
        handlers: HandlerRegistry,
        config: WorkerEngineConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            handlers,
            config,
            claim_rng: std::sync::Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Runs the loop until `shutdown` reports `true`. On shutdown, stops
    /// claiming new work; a task already in flight is given the rest of
    /// `grace` to finish before the loop returns (relinquishing the claim
    /// by simply stopping renewal — the reclaimer recovers it).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, grace: Duration) {
        let mut backoff = self.config.backoff_base;
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(err) = self
                .store
                .upsert_worker_heartbeat(
                    &self.config.worker_id,
                    &self.config.capabilities,
                    WorkerStatus::Idle,
                )
                .await
            {
                tracing::warn!(
                    event = "worker.heartbeat.failed",
                    worker_id = %self.config.worker_id,
                    error = %err,
                    "heartbeat update failed"
                );
            }

            let claimed = match self.try_claim_once().await {
                Ok(task) => task,
                Err(err) => {
                    tracing::warn!(
                        event = "worker.claim.error",
                        worker_id = %self.config.worker_id,
                        error = %err,
                        "claim attempt failed, will retry after backoff"
                    );
                    None
                }
            };

            let Some(task) = claimed else {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {}
                }
                backoff = (backoff * 2).min(self.config.backoff_cap);
                continue;
            };
            backoff = self.config.backoff_base;

            if let Err(err) = self
                .store
                .upsert_worker_heartbeat(
                    &self.config.worker_id,
                    &self.config.capabilities,
                    WorkerStatus::Busy,
                )
                .await
            {
                tracing::warn!(
                    event = "worker.heartbeat.failed",
                    worker_id = %self.config.worker_id,
                    error = %err,
                    "heartbeat update failed"
                );
            }

            let finalized = self.execute_and_finalize(task, &shutdown, grace).await;
            if let Err(err) = finalized {
                tracing::error!(
                    event = "worker.finalize.exhausted",
                    worker_id = %self.config.worker_id,
                    error = %err,
                    "giving up after repeated finalize failures; lease will expire and be reclaimed"
                );
                break;
            }
        }

        if let Err(err) = self
            .store
            .upsert_worker_heartbeat(
                &self.config.worker_id,
                &self.config.capabilities,
                WorkerStatus::Offline,
            )
            .await
        {
            tracing::warn!(
                event = "worker.heartbeat.failed",
                worker_id = %self.config.worker_id,
                error = %err,
                "heartbeat update failed"
            );
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>, grace: Duration) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown, grace).await })
    }

    async fn try_claim_once(&self) -> Result<Option<Task>, QueueError> {
        for _ in 0..self.config.max_claim_attempts.max(1) {
            let candidate = self
                .scheduler
                .pick_candidate(self.store.as_ref(), &self.config.capabilities)
                .await?;
            let Some(id) = candidate else {
                return Ok(None);
            };
            if let Some(task) = self
                .store
                .claim(id, &self.config.worker_id, self.config.lease_duration)
                .await?
            {
                return Ok(Some(task));
            }
            // Lost the race; another worker claimed it first. Re-sample.
        }
        Ok(None)
    }

    async fn execute_and_finalize(
        &self,
        task: Task,
        shutdown: &watch::Receiver<bool>,
        grace: Duration,
    ) -> Result<(), QueueError> {
        let token = CancellationToken::default();
        let renewal = self.spawn_lease_renewal(task.id, token.clone());

        let handler = self.handlers.get(&task.task_type).cloned();
        let mut shutdown_signal = shutdown.clone();
        let outcome = match handler {
            Some(handler) => {
                let ctx = HandlerContext {
                    cancellation: token.clone(),
                };
                let handle_fut = handler.handle(&task, ctx);
                tokio::pin!(handle_fut);
                tokio::select! {
                    result = &mut handle_fut => Some(result),
                    _ = shutdown_signal.changed() => {
                        // Shutdown requested: give the in-flight handler the
                        // rest of the grace window before giving up on it. If
                        // it still hasn't finished, relinquish the claim
                        // outright rather than recording a failure — the
                        // lease simply expires and the reclaimer recovers it.
                        tokio::time::timeout(grace, &mut handle_fut).await.ok()
                    }
                }
            }
            None => Some(Err(anyhow::anyhow!(
                "no handler registered for task type '{}'",
                task.task_type
            ))),
        };
        renewal.abort();

        match outcome {
            Some(result) => self.finalize(&task, result).await,
            None => {
                tracing::info!(
                    event = "worker.shutdown.abandoned_task",
                    task_id = task.id,
                    "shutdown grace window elapsed before handler finished; relinquishing lease"
                );
                Ok(())
            }
        }
    }

    fn spawn_lease_renewal(&self, task_id: crate::task::TaskId, token: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let worker_id = self.config.worker_id.clone();
        let lease_duration = self.config.lease_duration;
        let interval = (lease_duration / 3).max(Duration::from_millis(50));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.get_task(task_id).await {
                    Ok(current) => {
                        if current.locked_by.as_deref() != Some(worker_id.as_str()) {
                            break;
                        }
                        if current.cancel_requested {
                            token.cancel();
                        }
                        if let Err(err) =
                            store.renew_lease(task_id, &worker_id, lease_duration).await
                        {
                            tracing::warn!(
                                event = "worker.lease.renew_failed",
                                task_id,
                                worker_id = %worker_id,
                                error = %err,
                                "lease renewal failed, lease may expire"
                            );
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            event = "worker.lease.renew_lookup_failed",
                            task_id,
                            error = %err,
                            "could not read task state during renewal"
                        );
                        break;
                    }
                }
            }
        })
    }

    async fn finalize(&self, task: &Task, outcome: anyhow::Result<()>) -> Result<(), QueueError> {
        let attempts = self.config.finalize_max_attempts.max(1);
        for attempt in 1..=attempts {
            let result = match &outcome {
                Ok(()) => self.store.mark_succeeded(task.id, &self.config.worker_id).await,
                Err(err) => {
                    let mut rng = self.claim_rng.lock().expect("claim rng poisoned");
                    let delay = compute_delay(
                        self.config.backoff_base,
                        self.config.backoff_cap,
                        task.attempts.max(1) as u32,
                        &mut rng,
                    );
                    self.store
                        .mark_failed(task.id, &self.config.worker_id, &err.to_string(), delay)
                        .await
                }
            };

            match result {
                Ok(()) => {
                    self.log_finalize_outcome(task, &outcome).await;
                    return Ok(());
                }
                Err(QueueError::LeaseLost(id)) => {
                    tracing::info!(
                        event = "worker.finalize.lease_lost",
                        task_id = id,
                        "lease already reassigned, dropping this worker's result"
                    );
                    return Ok(());
                }
                Err(err) if attempt < attempts => {
                    tracing::warn!(
                        event = "worker.finalize.retry",
                        task_id = task.id,
                        attempt,
                        error = %err,
                        "finalize attempt failed, retrying"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("loop always returns on the last attempt")
    }

    /// Writes the audit trail entry for a finalized attempt (spec.md §3
    /// "TaskLog"). Best-effort: a logging failure never fails the attempt
    /// that already committed.
    async fn log_finalize_outcome(&self, task: &Task, outcome: &anyhow::Result<()>) {
        let (severity, message) = match outcome {
            Ok(()) => (
                crate::task::LogSeverity::Info,
                format!("attempt {} succeeded", task.attempts),
            ),
            Err(err) => match self.store.get_task(task.id).await {
                Ok(after) if after.status == crate::task::TaskStatus::DeadLetter => (
                    crate::task::LogSeverity::Error,
                    format!("attempt {} failed, dead-lettered: {err}", task.attempts),
                ),
                _ => (
                    crate::task::LogSeverity::Warn,
                    format!("attempt {} failed, will retry: {err}", task.attempts),
                ),
            },
        };
        if let Err(log_err) = self.store.append_log(task.id, severity, &message).await {
            tracing::warn!(
                event = "worker.log.append_failed",
                task_id = task.id,
                error = %log_err,
                "failed to write task audit log"
            );
        }
    }
}

/// Sweeps expired leases on a fixed interval. Independent of any single
/// worker loop; safe to run from more than one worker at once since the
/// underlying SQL predicate is idempotent (spec §4.5 "Orphan reclaimer").
pub fn spawn_reclaimer(
    store: Arc<dyn TaskStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            match store.reclaim_expired_leases(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::info!(event = "reclaimer.swept", count, "reclaimed expired leases");
                }
                Err(err) => {
                    tracing::warn!(event = "reclaimer.failed", error = %err, "reclaim sweep failed");
                }
            }
        }
    })
}
