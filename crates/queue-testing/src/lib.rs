//! An in-memory [`TaskStore`] fake, so adapter and engine tests don't need a
//! real SQLite file for every case. Mirrors `queue-sqlite`'s semantics
//! (claim atomicity, cancel precedence, dead-lettering) over a `DashMap`
//! instead of a writer pool — one row lock stands in for `BEGIN IMMEDIATE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use queue_core::{
    is_compatible, CandidateOrder, CandidateSource, CandidateTask, EnqueueOutcome, LogSeverity,
    NewTask, QueueError, QueueStats, Task, TaskId, TaskLog, TaskStatus, TaskStore, WorkerInfo,
    WorkerStatus,
};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

pub struct InMemoryStore {
    tasks: DashMap<TaskId, Task>,
    logs: Mutex<Vec<TaskLog>>,
    workers: DashMap<String, WorkerInfo>,
    next_id: AtomicI64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            logs: Mutex::new(Vec::new()),
            workers: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Test/diagnostic accessor mirroring `workers` table reads — no
    /// production code path depends on this, but it lets engine tests assert
    /// a worker's last-reported status without a real database.
    pub fn worker_info(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.get(worker_id).map(|entry| entry.value().clone())
    }
}

/// Convenience constructor for call sites that just need a fresh `Arc<dyn TaskStore>`.
pub fn in_memory_store() -> Arc<dyn TaskStore> {
    Arc::new(InMemoryStore::new())
}

fn is_eligible(task: &Task, now: DateTime<Utc>) -> bool {
    task.status == TaskStatus::Queued && task.run_after_utc.map(|t| t <= now).unwrap_or(true)
}

#[async_trait]
impl CandidateSource for InMemoryStore {
    async fn top_candidate(
        &self,
        order: CandidateOrder,
        capabilities: &Value,
    ) -> Result<Option<TaskId>, QueueError> {
        let now = Utc::now();
        let mut candidates: Vec<Task> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|t| is_eligible(t, now) && is_compatible(&t.compatibility, capabilities))
            .collect();

        match order {
            CandidateOrder::Fifo => {
                candidates.sort_by(|a, b| (a.created_at_utc, a.id).cmp(&(b.created_at_utc, b.id)))
            }
            CandidateOrder::Lifo => {
                candidates.sort_by(|a, b| (b.created_at_utc, b.id).cmp(&(a.created_at_utc, a.id)))
            }
            CandidateOrder::Priority => candidates
                .sort_by(|a, b| (a.priority, a.created_at_utc).cmp(&(b.priority, b.created_at_utc))),
        }

        Ok(candidates.into_iter().next().map(|t| t.id))
    }

    async fn eligible_candidates(
        &self,
        capabilities: &Value,
        limit: usize,
    ) -> Result<Vec<CandidateTask>, QueueError> {
        let now = Utc::now();
        let mut candidates: Vec<Task> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|t| is_eligible(t, now) && is_compatible(&t.compatibility, capabilities))
            .collect();
        candidates.sort_by_key(|t| t.id);
        candidates.truncate(limit);
        Ok(candidates
            .into_iter()
            .map(|t| CandidateTask {
                id: t.id,
                priority: t.priority,
            })
            .collect())
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn enqueue_checked(&self, new_task: NewTask) -> Result<EnqueueOutcome, QueueError> {
        if new_task.task_type.trim().is_empty() {
            return Err(QueueError::Validation("type must not be empty".into()));
        }
        if !(1..=1000).contains(&new_task.priority) {
            return Err(QueueError::Validation(
                "priority must be between 1 and 1000".into(),
            ));
        }
        if !(1..=10).contains(&new_task.max_attempts) {
            return Err(QueueError::Validation(
                "max_attempts must be between 1 and 10".into(),
            ));
        }

        if let Some(key) = &new_task.idempotency_key {
            let existing = self.tasks.iter().find(|entry| {
                entry.value().idempotency_key.as_deref() == Some(key.as_str())
                    && !entry.value().status.is_terminal()
            });
            if let Some(entry) = existing {
                return Ok(EnqueueOutcome::Existing(*entry.key()));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let task = Task {
            id,
            task_type: new_task.task_type,
            priority: new_task.priority,
            status: TaskStatus::Queued,
            payload: new_task.payload,
            compatibility: new_task.compatibility,
            attempts: 0,
            max_attempts: new_task.max_attempts,
            run_after_utc: new_task.run_after_utc,
            created_at_utc: now,
            processing_started_utc: None,
            finished_at_utc: None,
            locked_by: None,
            lease_expires_utc: None,
            error_message: None,
            idempotency_key: new_task.idempotency_key,
            cancel_requested: false,
        };
        self.tasks.insert(id, task);
        Ok(EnqueueOutcome::Created(id))
    }

    async fn get_task(&self, id: TaskId) -> Result<Task, QueueError> {
        self.tasks
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(QueueError::NotFound(id))
    }

    async fn cancel(&self, id: TaskId) -> Result<TaskStatus, QueueError> {
        let mut entry = self.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if entry.status.is_terminal() {
            return Ok(entry.status);
        }
        if entry.status == TaskStatus::Queued {
            entry.status = TaskStatus::Cancelled;
            entry.finished_at_utc = Some(Utc::now());
            return Ok(TaskStatus::Cancelled);
        }
        entry.cancel_requested = true;
        Ok(TaskStatus::Processing)
    }

    async fn claim(
        &self,
        id: TaskId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let mut entry = match self.tasks.get_mut(&id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let now = Utc::now();
        if !is_eligible(&entry, now) {
            return Ok(None);
        }

        entry.status = TaskStatus::Processing;
        entry.locked_by = Some(worker_id.to_string());
        entry.lease_expires_utc = Some(now + chrono::Duration::from_std(lease_duration).unwrap());
        entry.processing_started_utc.get_or_insert(now);
        entry.attempts += 1;
        Ok(Some(entry.value().clone()))
    }

    async fn renew_lease(
        &self,
        id: TaskId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<(), QueueError> {
        let mut entry = self.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if entry.status != TaskStatus::Processing || entry.locked_by.as_deref() != Some(worker_id)
        {
            return Err(QueueError::LeaseLost(id));
        }
        entry.lease_expires_utc =
            Some(Utc::now() + chrono::Duration::from_std(lease_duration).unwrap());
        Ok(())
    }

    async fn mark_succeeded(&self, id: TaskId, worker_id: &str) -> Result<(), QueueError> {
        let mut entry = self.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if entry.status != TaskStatus::Processing || entry.locked_by.as_deref() != Some(worker_id)
        {
            return Err(QueueError::LeaseLost(id));
        }
        entry.status = if entry.cancel_requested {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Succeeded
        };
        entry.finished_at_utc = Some(Utc::now());
        entry.locked_by = None;
        entry.lease_expires_utc = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: TaskId,
        worker_id: &str,
        error_message: &str,
        retry_delay: Duration,
    ) -> Result<(), QueueError> {
        let mut entry = self.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if entry.locked_by.as_deref() != Some(worker_id) {
            return Err(QueueError::LeaseLost(id));
        }

        entry.error_message = Some(error_message.to_string());
        entry.locked_by = None;
        entry.lease_expires_utc = None;

        if entry.cancel_requested {
            entry.status = TaskStatus::Cancelled;
            entry.finished_at_utc = Some(Utc::now());
        } else if entry.attempts >= entry.max_attempts {
            entry.status = TaskStatus::DeadLetter;
            entry.finished_at_utc = Some(Utc::now());
        } else {
            entry.status = TaskStatus::Queued;
            entry.run_after_utc =
                Some(Utc::now() + chrono::Duration::from_std(retry_delay).unwrap_or_default());
        }
        Ok(())
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut reclaimed = 0u64;
        for mut entry in self.tasks.iter_mut() {
            if entry.status != TaskStatus::Processing {
                continue;
            }
            let Some(expires) = entry.lease_expires_utc else {
                continue;
            };
            if expires >= now {
                continue;
            }
            entry.locked_by = None;
            entry.lease_expires_utc = None;
            if entry.attempts >= entry.max_attempts {
                entry.status = TaskStatus::DeadLetter;
                entry.finished_at_utc = Some(now);
                entry
                    .error_message
                    .get_or_insert_with(|| "lease expired, attempts exhausted".to_string());
            } else {
                entry.status = TaskStatus::Queued;
            }
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats {
            total: 0,
            queued: 0,
            processing: 0,
            succeeded: 0,
            failed: 0,
            dead_letter: 0,
            cancelled: 0,
            oldest_queued_age_seconds: None,
        };
        let mut oldest: Option<DateTime<Utc>> = None;

        for entry in self.tasks.iter() {
            let task = entry.value();
            stats.total += 1;
            match task.status {
                TaskStatus::Queued => {
                    stats.queued += 1;
                    oldest = Some(match oldest {
                        Some(current) => current.min(task.created_at_utc),
                        None => task.created_at_utc,
                    });
                }
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Succeeded => stats.succeeded += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::DeadLetter => stats.dead_letter += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }

        stats.oldest_queued_age_seconds = oldest
            .map(|ts| (Utc::now() - ts).num_milliseconds() as f64 / 1000.0);
        Ok(stats)
    }

    async fn upsert_worker_heartbeat(
        &self,
        worker_id: &str,
        capabilities: &Value,
        status: WorkerStatus,
    ) -> Result<(), QueueError> {
        self.workers.insert(
            worker_id.to_string(),
            WorkerInfo {
                id: worker_id.to_string(),
                capabilities: capabilities.clone(),
                last_heartbeat_utc: Utc::now(),
                status,
            },
        );
        Ok(())
    }

    async fn append_log(
        &self,
        task_id: TaskId,
        severity: LogSeverity,
        message: &str,
    ) -> Result<(), QueueError> {
        self.logs.lock().expect("log lock poisoned").push(TaskLog {
            task_id,
            ts_utc: Utc::now(),
            severity,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn task_logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>, QueueError> {
        Ok(self
            .logs
            .lock()
            .expect("log lock poisoned")
            .iter()
            .filter(|entry| entry.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn claim_transitions_to_processing_and_increments_attempts() {
        let store = InMemoryStore::new();
        let id = store.enqueue(NewTask::new("echo")).await.unwrap();
        let claimed = store
            .claim(id, "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn second_claim_fails_while_processing() {
        let store = InMemoryStore::new();
        let id = store.enqueue(NewTask::new("echo")).await.unwrap();
        store
            .claim(id, "w1", Duration::from_secs(30))
            .await
            .unwrap();
        let second = store.claim(id, "w2", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn idempotent_enqueue_returns_existing_id() {
        let store = InMemoryStore::new();
        let mut new_task = NewTask::new("echo");
        new_task.idempotency_key = Some("k".into());
        let a = store.enqueue(new_task.clone()).await.unwrap();
        let b = store.enqueue(new_task).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn compatibility_gate_respected_by_top_candidate() {
        let store = InMemoryStore::new();
        let mut task = NewTask::new("render");
        task.compatibility = json!({"gpu": true});
        store.enqueue(task).await.unwrap();

        let none = store
            .top_candidate(CandidateOrder::Fifo, &json!({"gpu": false}))
            .await
            .unwrap();
        assert!(none.is_none());

        let some = store
            .top_candidate(CandidateOrder::Fifo, &json!({"gpu": true}))
            .await
            .unwrap();
        assert!(some.is_some());
    }
}

/// End-to-end seed scenarios run against a real [`queue_core::WorkerEngine`]
/// driving this in-memory store, rather than unit-testing the store alone.
#[cfg(test)]
mod engine_scenarios {
    use super::*;
    use async_trait::async_trait;
    use queue_core::{
        FifoScheduler, HandlerContext, HandlerRegistry, PriorityScheduler, Scheduler, TaskHandler,
        WeightedRandomScheduler, WorkerEngine, WorkerEngineConfig,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::watch;

    struct AlwaysSucceeds;

    #[async_trait]
    impl TaskHandler for AlwaysSucceeds {
        async fn handle(&self, _task: &Task, _ctx: HandlerContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl TaskHandler for AlwaysFails {
        async fn handle(&self, _task: &Task, _ctx: HandlerContext) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    /// A handler that succeeds starting from its Nth invocation across the
    /// whole test (used to simulate scenario C's "a different worker
    /// eventually completes it" without needing two real worker processes).
    struct SucceedsAfter {
        attempts_seen: AtomicUsize,
        succeed_on_attempt: usize,
    }

    #[async_trait]
    impl TaskHandler for SucceedsAfter {
        async fn handle(&self, task: &Task, _ctx: HandlerContext) -> anyhow::Result<()> {
            let seen = self.attempts_seen.fetch_add(1, Ordering::SeqCst) + 1;
            if task.attempts >= self.succeed_on_attempt || seen >= self.succeed_on_attempt {
                Ok(())
            } else {
                // Never renews, never finalizes: simulates a crashed worker.
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    fn fast_config(worker_id: &str) -> WorkerEngineConfig {
        let mut cfg = WorkerEngineConfig::new(worker_id);
        cfg.lease_duration = Duration::from_millis(150);
        cfg.backoff_base = Duration::from_millis(10);
        cfg.backoff_cap = Duration::from_millis(50);
        cfg
    }

    async fn wait_for_terminal(store: &InMemoryStore, id: TaskId, timeout: Duration) -> Task {
        let deadline = Instant::now() + timeout;
        loop {
            let task = store.get_task(id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            assert!(Instant::now() < deadline, "task {id} never reached a terminal state");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn scenario_a_happy_path() {
        let store = Arc::new(InMemoryStore::new());
        let id = {
            let mut task = NewTask::new("echo");
            task.payload = json!({"msg": "hi"});
            store.enqueue(task).await.unwrap()
        };

        let mut handlers = HandlerRegistry::new();
        handlers.insert("echo".to_string(), Arc::new(AlwaysSucceeds) as Arc<dyn TaskHandler>);
        let engine = Arc::new(WorkerEngine::new(
            store.clone() as Arc<dyn TaskStore>,
            Arc::new(FifoScheduler) as Arc<dyn Scheduler>,
            handlers,
            fast_config("w1"),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = engine.spawn(shutdown_rx, Duration::from_millis(200));

        let task = wait_for_terminal(&store, id, Duration::from_secs(2)).await;
        shutdown_tx.send(true).ok();
        handle.await.unwrap();

        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 1);
        assert!(task.finished_at_utc.is_some());
        assert!(task.locked_by.is_none());

        let logs = store.task_logs(id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].severity, queue_core::LogSeverity::Info);

        let worker = store.worker_info("w1").unwrap();
        assert_eq!(worker.status, queue_core::WorkerStatus::Offline);
    }

    #[tokio::test]
    async fn scenario_b_retry_then_dead_letter() {
        let store = Arc::new(InMemoryStore::new());
        let id = {
            let mut task = NewTask::new("doomed");
            task.max_attempts = 3;
            store.enqueue(task).await.unwrap()
        };

        let mut handlers = HandlerRegistry::new();
        handlers.insert("doomed".to_string(), Arc::new(AlwaysFails) as Arc<dyn TaskHandler>);
        let engine = Arc::new(WorkerEngine::new(
            store.clone() as Arc<dyn TaskStore>,
            Arc::new(FifoScheduler) as Arc<dyn Scheduler>,
            handlers,
            fast_config("w1"),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = engine.spawn(shutdown_rx, Duration::from_millis(200));

        let task = wait_for_terminal(&store, id, Duration::from_secs(5)).await;
        shutdown_tx.send(true).ok();
        handle.await.unwrap();

        assert_eq!(task.status, TaskStatus::DeadLetter);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.error_message.as_deref(), Some("boom"));

        let logs = store.task_logs(id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].severity, queue_core::LogSeverity::Warn);
        assert_eq!(logs[2].severity, queue_core::LogSeverity::Error);
    }

    #[tokio::test]
    async fn scenario_c_orphan_reclaim_then_second_worker_completes() {
        let store = Arc::new(InMemoryStore::new());
        let id = store.enqueue(NewTask::new("flaky")).await.unwrap();

        let handler = Arc::new(SucceedsAfter {
            attempts_seen: AtomicUsize::new(0),
            succeed_on_attempt: 2,
        }) as Arc<dyn TaskHandler>;

        let mut handlers_a = HandlerRegistry::new();
        handlers_a.insert("flaky".to_string(), handler.clone());
        let mut handlers_b = HandlerRegistry::new();
        handlers_b.insert("flaky".to_string(), handler);

        // Worker A claims first and "crashes" (its handler never returns).
        // Worker B keeps polling with empty claims until the reclaimer puts
        // the task back in `queued`, then finishes it.
        let engine_a = Arc::new(WorkerEngine::new(
            store.clone() as Arc<dyn TaskStore>,
            Arc::new(FifoScheduler) as Arc<dyn Scheduler>,
            handlers_a,
            fast_config("worker-a"),
        ));
        let engine_b = Arc::new(WorkerEngine::new(
            store.clone() as Arc<dyn TaskStore>,
            Arc::new(FifoScheduler) as Arc<dyn Scheduler>,
            handlers_b,
            fast_config("worker-b"),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle_a = engine_a.spawn(shutdown_rx.clone(), Duration::from_millis(50));
        let handle_b = engine_b.spawn(shutdown_rx.clone(), Duration::from_millis(50));
        let reclaimer_handle = queue_core::spawn_reclaimer(
            store.clone() as Arc<dyn TaskStore>,
            Duration::from_millis(40),
            shutdown_rx,
        );

        let task = wait_for_terminal(&store, id, Duration::from_secs(5)).await;
        shutdown_tx.send(true).ok();
        handle_a.await.unwrap();
        handle_b.await.unwrap();
        reclaimer_handle.await.unwrap();

        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test]
    async fn scenario_d_priority_drains_in_priority_order() {
        let store = InMemoryStore::new();
        let mut t1 = NewTask::new("echo");
        t1.priority = 100;
        let mut t2 = NewTask::new("echo");
        t2.priority = 1;
        let mut t3 = NewTask::new("echo");
        t3.priority = 50;

        let id1 = store.enqueue(t1).await.unwrap();
        let id2 = store.enqueue(t2).await.unwrap();
        let id3 = store.enqueue(t3).await.unwrap();

        let scheduler = PriorityScheduler;
        let mut order = Vec::new();
        for _ in 0..3 {
            let picked = scheduler
                .pick_candidate(&store, &json!({}))
                .await
                .unwrap()
                .unwrap();
            store.claim(picked, "w1", Duration::from_secs(30)).await.unwrap();
            order.push(picked);
        }

        assert_eq!(order, vec![id2, id3, id1]);
    }

    #[tokio::test]
    async fn scenario_e_weighted_random_favors_higher_weight() {
        let mut low_priority_wins = 0;
        for _ in 0..100 {
            let store = InMemoryStore::new();
            let mut low_ids = Vec::new();
            for _ in 0..5 {
                let mut t = NewTask::new("echo");
                t.priority = 1;
                low_ids.push(store.enqueue(t).await.unwrap());
            }
            for _ in 0..5 {
                let mut t = NewTask::new("echo");
                t.priority = 100;
                store.enqueue(t).await.unwrap();
            }

            let scheduler = WeightedRandomScheduler::new();
            let picked = scheduler.pick_candidate(&store, &json!({})).await.unwrap().unwrap();
            if low_ids.contains(&picked) {
                low_priority_wins += 1;
            }
        }

        assert!(low_priority_wins >= 90, "got {low_priority_wins}/100");
    }
}
