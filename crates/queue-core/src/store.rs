//! The repository interface implemented by a concrete storage engine.
//!
//! A policy-light contract the queue core programs against, leaving the
//! storage engine free to be SQLite, Postgres, or an in-memory fake for
//! tests.

use crate::error::QueueError;
use crate::task::{NewTask, QueueStats, Task, TaskId, TaskStatus};
use crate::worker::WorkerStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

/// Ordering a deterministic scheduling strategy asks the store to apply.
/// Weighted-random does not use this — it asks for the full eligible set
/// instead (see [`CandidateSource::eligible_candidates`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrder {
    /// `created_at_utc ASC, id ASC`
    Fifo,
    /// `created_at_utc DESC, id DESC`
    Lifo,
    /// `priority ASC, created_at_utc ASC`
    Priority,
}

/// A queued, eligible task as seen by a scheduling strategy — enough to
/// compute a weight or apply a tie-break, not a full row fetch.
#[derive(Debug, Clone, Copy)]
pub struct CandidateTask {
    pub id: TaskId,
    pub priority: i32,
}

/// Result of an `enqueue` call, distinguishing a fresh insert from a
/// no-op resolution to a prior non-terminal task with the same
/// `idempotency_key` (spec.md §3, §6 — the HTTP adapter reports the
/// latter as 409 rather than 201).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(TaskId),
    Existing(TaskId),
}

impl EnqueueOutcome {
    pub fn task_id(self) -> TaskId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Existing(id) => id,
        }
    }

    pub fn is_existing(self) -> bool {
        matches!(self, EnqueueOutcome::Existing(_))
    }
}

/// The advisory, non-locking half of scheduling: "what would I pick?"
/// Implemented by the storage engine because only it can express the
/// ordering as an indexed SQL query.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn top_candidate(
        &self,
        order: CandidateOrder,
        capabilities: &Value,
    ) -> Result<Option<TaskId>, QueueError>;

    async fn eligible_candidates(
        &self,
        capabilities: &Value,
        limit: usize,
    ) -> Result<Vec<CandidateTask>, QueueError>;
}

#[async_trait]
pub trait TaskStore: CandidateSource + Send + Sync {
    /// Inserts `new_task`, or resolves it to a prior non-terminal task with
    /// the same `idempotency_key` without inserting (spec.md §3). Callers
    /// that only need the id can use [`TaskStore::enqueue`] instead.
    async fn enqueue_checked(&self, new_task: NewTask) -> Result<EnqueueOutcome, QueueError>;

    /// Convenience wrapper over [`TaskStore::enqueue_checked`] for callers
    /// that don't need to distinguish a fresh insert from an idempotent
    /// no-op (in-process producers, demos, most tests).
    async fn enqueue(&self, new_task: NewTask) -> Result<TaskId, QueueError> {
        Ok(self.enqueue_checked(new_task).await?.task_id())
    }

    async fn get_task(&self, id: TaskId) -> Result<Task, QueueError>;

    /// Valid only from `queued`; from `processing` it sets a pending flag
    /// consulted at the next finalize. Idempotent on terminal tasks.
    async fn cancel(&self, id: TaskId) -> Result<TaskStatus, QueueError>;

    /// The atomic `queued -> processing` transition (spec §4.4). Returns
    /// `Ok(None)` if another worker won the race or the row is no longer
    /// claimable; never commits a half-claim.
    async fn claim(
        &self,
        id: TaskId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Task>, QueueError>;

    /// Extends `lease_expires_utc`. Fails with `LeaseLost` if `worker_id`
    /// no longer owns the claim.
    async fn renew_lease(
        &self,
        id: TaskId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<(), QueueError>;

    /// Verifies lease ownership, then transitions to `succeeded` — or to
    /// `cancelled` if a cancel was requested while processing.
    async fn mark_succeeded(&self, id: TaskId, worker_id: &str) -> Result<(), QueueError>;

    /// Verifies lease ownership, then either reschedules to `queued` with
    /// `run_after_utc = now + retry_delay`, or dead-letters if `attempts`
    /// has reached `max_attempts`. A pending cancel still wins over both.
    async fn mark_failed(
        &self,
        id: TaskId,
        worker_id: &str,
        error_message: &str,
        retry_delay: Duration,
    ) -> Result<(), QueueError>;

    /// Sweeps `processing` rows whose lease has expired back to `queued`
    /// (or to `dead_letter` if already at `max_attempts`). Idempotent
    /// under concurrent reclaimers.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Upserts `workers.last_heartbeat_utc` / `capabilities` / `status`. Not
    /// on the claim hot path — purely for operator visibility (spec.md §3
    /// "Worker").
    async fn upsert_worker_heartbeat(
        &self,
        worker_id: &str,
        capabilities: &Value,
        status: WorkerStatus,
    ) -> Result<(), QueueError>;

    /// Appends one audit row (spec.md §3 "TaskLog"). Not on the claim hot
    /// path — the worker engine calls this at finalize/reclaim boundaries,
    /// never inside the claim transaction itself.
    async fn append_log(
        &self,
        task_id: TaskId,
        severity: crate::task::LogSeverity,
        message: &str,
    ) -> Result<(), QueueError>;

    /// Reads back a task's audit trail, oldest first.
    async fn task_logs(&self, task_id: TaskId) -> Result<Vec<crate::task::TaskLog>, QueueError>;
}
