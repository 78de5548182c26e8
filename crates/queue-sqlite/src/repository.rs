//! `TaskStore` / `CandidateSource` implementation over [`SqliteStorage`].

use crate::row::{parse_timestamp, row_to_task, storage_err};
use crate::storage::SqliteStorage;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use queue_core::{
    is_compatible, CandidateOrder, CandidateSource, CandidateTask, EnqueueOutcome, LogSeverity,
    NewTask, QueueError, QueueStats, Task, TaskId, TaskLog, TaskStatus, TaskStore, WorkerStatus,
};
use serde_json::Value;
use sqlx::Row;
use std::time::Duration;

fn validate_new_task(task: &NewTask) -> Result<(), QueueError> {
    if task.task_type.trim().is_empty() {
        return Err(QueueError::Validation("type must not be empty".into()));
    }
    if !(1..=1000).contains(&task.priority) {
        return Err(QueueError::Validation(
            "priority must be between 1 and 1000".into(),
        ));
    }
    if !(1..=10).contains(&task.max_attempts) {
        return Err(QueueError::Validation(
            "max_attempts must be between 1 and 10".into(),
        ));
    }
    Ok(())
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

impl SqliteStorage {
    async fn find_nonterminal_by_key(&self, key: &str) -> Result<Option<TaskId>, QueueError> {
        sqlx::query(
            "SELECT id FROM task_queue
             WHERE idempotency_key = ?1
               AND status NOT IN ('succeeded', 'failed', 'dead_letter', 'cancelled')
             LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.reader)
        .await
        .map_err(storage_err)
        .map(|row| row.map(|r| r.get::<TaskId, _>("id")))
    }
}

#[async_trait]
impl CandidateSource for SqliteStorage {
    async fn top_candidate(
        &self,
        order: CandidateOrder,
        capabilities: &Value,
    ) -> Result<Option<TaskId>, QueueError> {
        let order_clause = match order {
            CandidateOrder::Fifo => "created_at_utc ASC, id ASC",
            CandidateOrder::Lifo => "created_at_utc DESC, id DESC",
            CandidateOrder::Priority => "priority ASC, created_at_utc ASC",
        };
        // Compatibility is an opaque JSON blob; rather than express subset
        // matching in SQL we scan a bounded prefix of the eligible set in
        // the strategy's order and apply `is_compatible` in Rust. 64 is
        // generous for typical queue depths without risking a full scan.
        let now = to_rfc3339(Utc::now());
        let sql = format!(
            "SELECT id, compatibility FROM task_queue
             WHERE status = 'queued' AND (run_after_utc IS NULL OR run_after_utc <= ?1)
             ORDER BY {order_clause}
             LIMIT 64"
        );
        let rows = sqlx::query(&sql)
            .bind(&now)
            .fetch_all(&self.reader)
            .await
            .map_err(storage_err)?;

        for row in rows {
            let compat_raw: String = row.get("compatibility");
            let compat: Value = serde_json::from_str(&compat_raw).unwrap_or(Value::Null);
            if is_compatible(&compat, capabilities) {
                return Ok(Some(row.get("id")));
            }
        }
        Ok(None)
    }

    async fn eligible_candidates(
        &self,
        capabilities: &Value,
        limit: usize,
    ) -> Result<Vec<CandidateTask>, QueueError> {
        let now = to_rfc3339(Utc::now());
        let rows = sqlx::query(
            "SELECT id, priority, compatibility FROM task_queue
             WHERE status = 'queued' AND (run_after_utc IS NULL OR run_after_utc <= ?1)
             ORDER BY id ASC
             LIMIT ?2",
        )
        .bind(&now)
        .bind(limit as i64)
        .fetch_all(&self.reader)
        .await
        .map_err(storage_err)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let compat_raw: String = row.get("compatibility");
            let compat: Value = serde_json::from_str(&compat_raw).unwrap_or(Value::Null);
            if is_compatible(&compat, capabilities) {
                candidates.push(CandidateTask {
                    id: row.get("id"),
                    priority: row.get("priority"),
                });
            }
        }
        Ok(candidates)
    }
}

#[async_trait]
impl TaskStore for SqliteStorage {
    async fn enqueue_checked(&self, new_task: NewTask) -> Result<EnqueueOutcome, QueueError> {
        validate_new_task(&new_task)?;

        if let Some(key) = &new_task.idempotency_key {
            if let Some(existing) = self.find_nonterminal_by_key(key).await? {
                return Ok(EnqueueOutcome::Existing(existing));
            }
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO task_queue
                (task_type, priority, status, payload, compatibility, attempts, max_attempts,
                 run_after_utc, created_at_utc, idempotency_key, cancel_requested)
             VALUES (?1, ?2, 'queued', ?3, ?4, 0, ?5, ?6, ?7, ?8, 0)",
        )
        .bind(&new_task.task_type)
        .bind(new_task.priority)
        .bind(new_task.payload.to_string())
        .bind(new_task.compatibility.to_string())
        .bind(new_task.max_attempts)
        .bind(new_task.run_after_utc.map(to_rfc3339))
        .bind(to_rfc3339(now))
        .bind(&new_task.idempotency_key)
        .execute(&self.writer)
        .await;

        match result {
            Ok(res) => Ok(EnqueueOutcome::Created(res.last_insert_rowid())),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // Lost a race on the idempotency key between our lookup and
                // this insert; whoever won gets returned instead.
                if let Some(key) = &new_task.idempotency_key {
                    if let Some(existing) = self.find_nonterminal_by_key(key).await? {
                        return Ok(EnqueueOutcome::Existing(existing));
                    }
                }
                Err(QueueError::Validation(
                    "idempotency_key already in use".into(),
                ))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn get_task(&self, id: TaskId) -> Result<Task, QueueError> {
        let row = sqlx::query("SELECT * FROM task_queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.reader)
            .await
            .map_err(storage_err)?
            .ok_or(QueueError::NotFound(id))?;
        row_to_task(&row)
    }

    async fn cancel(&self, id: TaskId) -> Result<TaskStatus, QueueError> {
        let task = self.get_task(id).await?;
        if task.status.is_terminal() {
            return Ok(task.status);
        }

        if task.status == TaskStatus::Queued {
            let now = to_rfc3339(Utc::now());
            let result = sqlx::query(
                "UPDATE task_queue
                 SET status = 'cancelled', finished_at_utc = ?1
                 WHERE id = ?2 AND status = 'queued'",
            )
            .bind(&now)
            .bind(id)
            .execute(&self.writer)
            .await
            .map_err(storage_err)?;

            if result.rows_affected() == 0 {
                // Someone claimed it between our read and this write; fall
                // through to the pending-cancel path on re-read.
                return self.cancel(id).await;
            }
            return Ok(TaskStatus::Cancelled);
        }

        let result = sqlx::query(
            "UPDATE task_queue SET cancel_requested = 1 WHERE id = ?1 AND status = 'processing'",
        )
        .bind(id)
        .execute(&self.writer)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            // The task finalized (succeeded/failed/dead-lettered) between our
            // read and this write; re-read to report its actual current
            // status instead of a stale "processing".
            return self.cancel(id).await;
        }
        Ok(TaskStatus::Processing)
    }

    async fn claim(
        &self,
        id: TaskId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let mut conn = self.writer.acquire().await.map_err(storage_err)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        let precheck = sqlx::query("SELECT status, run_after_utc FROM task_queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage_err)?;

        let Some(precheck) = precheck else {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Ok(None);
        };

        let now = Utc::now();
        let status: String = precheck.get("status");
        let run_after: Option<String> = precheck.get("run_after_utc");
        let run_after_ok = match run_after {
            Some(raw) => parse_timestamp(&raw)? <= now,
            None => true,
        };

        if status != "queued" || !run_after_ok {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Ok(None);
        }

        let lease_expires = now
            + ChronoDuration::from_std(lease_duration).unwrap_or_else(|_| ChronoDuration::seconds(60));

        let update = sqlx::query(
            "UPDATE task_queue
             SET status = 'processing',
                 locked_by = ?1,
                 lease_expires_utc = ?2,
                 processing_started_utc = COALESCE(processing_started_utc, ?3),
                 attempts = attempts + 1
             WHERE id = ?4 AND status = 'queued'",
        )
        .bind(worker_id)
        .bind(to_rfc3339(lease_expires))
        .bind(to_rfc3339(now))
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;

        if update.rows_affected() == 0 {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM task_queue WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .map_err(storage_err)?;

        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        Ok(Some(row_to_task(&row)?))
    }

    async fn renew_lease(
        &self,
        id: TaskId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<(), QueueError> {
        let new_expires = Utc::now()
            + ChronoDuration::from_std(lease_duration).unwrap_or_else(|_| ChronoDuration::seconds(60));

        let result = sqlx::query(
            "UPDATE task_queue
             SET lease_expires_utc = ?1
             WHERE id = ?2 AND status = 'processing' AND locked_by = ?3",
        )
        .bind(to_rfc3339(new_expires))
        .bind(id)
        .bind(worker_id)
        .execute(&self.writer)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(id));
        }
        Ok(())
    }

    async fn mark_succeeded(&self, id: TaskId, worker_id: &str) -> Result<(), QueueError> {
        let now = to_rfc3339(Utc::now());
        let result = sqlx::query(
            "UPDATE task_queue
             SET status = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'succeeded' END,
                 finished_at_utc = ?1,
                 locked_by = NULL,
                 lease_expires_utc = NULL
             WHERE id = ?2 AND status = 'processing' AND locked_by = ?3",
        )
        .bind(&now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.writer)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: TaskId,
        worker_id: &str,
        error_message: &str,
        retry_delay: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.writer.acquire().await.map_err(storage_err)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        let row = sqlx::query(
            "SELECT attempts, max_attempts, cancel_requested, locked_by
             FROM task_queue WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err)?;

        let Some(row) = row else {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(QueueError::NotFound(id));
        };

        let locked_by: Option<String> = row.get("locked_by");
        if locked_by.as_deref() != Some(worker_id) {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            return Err(QueueError::LeaseLost(id));
        }

        let cancel_requested: i64 = row.get("cancel_requested");
        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");
        let now = Utc::now();

        if cancel_requested != 0 {
            sqlx::query(
                "UPDATE task_queue
                 SET status = 'cancelled', finished_at_utc = ?1, locked_by = NULL,
                     lease_expires_utc = NULL, error_message = ?2
                 WHERE id = ?3",
            )
            .bind(to_rfc3339(now))
            .bind(error_message)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        } else if attempts >= max_attempts {
            sqlx::query(
                "UPDATE task_queue
                 SET status = 'dead_letter', finished_at_utc = ?1, locked_by = NULL,
                     lease_expires_utc = NULL, error_message = ?2
                 WHERE id = ?3",
            )
            .bind(to_rfc3339(now))
            .bind(error_message)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        } else {
            let run_after = now
                + ChronoDuration::from_std(retry_delay).unwrap_or_else(|_| ChronoDuration::zero());
            sqlx::query(
                "UPDATE task_queue
                 SET status = 'queued', run_after_utc = ?1, locked_by = NULL,
                     lease_expires_utc = NULL, error_message = ?2
                 WHERE id = ?3",
            )
            .bind(to_rfc3339(run_after))
            .bind(error_message)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        }

        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut conn = self.writer.acquire().await.map_err(storage_err)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        let now_str = to_rfc3339(now);

        // attempts is incremented at claim time, so a row already at
        // max_attempts when its lease expires has exhausted its one
        // execution attempt for that claim and dead-letters directly.
        let dead = sqlx::query(
            "UPDATE task_queue
             SET status = 'dead_letter', finished_at_utc = ?1, locked_by = NULL,
                 lease_expires_utc = NULL,
                 error_message = COALESCE(error_message, 'lease expired, attempts exhausted')
             WHERE status = 'processing' AND lease_expires_utc < ?2 AND attempts >= max_attempts",
        )
        .bind(&now_str)
        .bind(&now_str)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;

        let requeued = sqlx::query(
            "UPDATE task_queue
             SET status = 'queued', locked_by = NULL, lease_expires_utc = NULL
             WHERE status = 'processing' AND lease_expires_utc < ?1 AND attempts < max_attempts",
        )
        .bind(&now_str)
        .execute(&mut *conn)
        .await
        .map_err(storage_err)?;

        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        Ok(dead.rows_affected() + requeued.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'dead_letter') AS dead_letter,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled
             FROM task_queue",
        )
        .fetch_one(&self.reader)
        .await
        .map_err(storage_err)?;

        let oldest: Option<String> = sqlx::query_scalar(
            "SELECT created_at_utc FROM task_queue
             WHERE status = 'queued'
             ORDER BY created_at_utc ASC LIMIT 1",
        )
        .fetch_optional(&self.reader)
        .await
        .map_err(storage_err)?;

        let oldest_queued_age_seconds = match oldest {
            Some(raw) => {
                let ts = parse_timestamp(&raw)?;
                Some((Utc::now() - ts).num_milliseconds() as f64 / 1000.0)
            }
            None => None,
        };

        Ok(QueueStats {
            total: row.get("total"),
            queued: row.get("queued"),
            processing: row.get("processing"),
            succeeded: row.get("succeeded"),
            failed: row.get("failed"),
            dead_letter: row.get("dead_letter"),
            cancelled: row.get("cancelled"),
            oldest_queued_age_seconds,
        })
    }

    async fn upsert_worker_heartbeat(
        &self,
        worker_id: &str,
        capabilities: &Value,
        status: WorkerStatus,
    ) -> Result<(), QueueError> {
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "INSERT INTO workers (id, capabilities, last_heartbeat_utc, status)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                capabilities = excluded.capabilities,
                last_heartbeat_utc = excluded.last_heartbeat_utc,
                status = excluded.status",
        )
        .bind(worker_id)
        .bind(capabilities.to_string())
        .bind(&now)
        .bind(status.as_str())
        .execute(&self.writer)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn append_log(
        &self,
        task_id: TaskId,
        severity: LogSeverity,
        message: &str,
    ) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO task_log (task_id, ts_utc, severity, message) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(task_id)
        .bind(to_rfc3339(Utc::now()))
        .bind(severity.as_str())
        .bind(message)
        .execute(&self.writer)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn task_logs(&self, task_id: TaskId) -> Result<Vec<TaskLog>, QueueError> {
        let rows = sqlx::query(
            "SELECT ts_utc, severity, message FROM task_log
             WHERE task_id = ?1 ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.reader)
        .await
        .map_err(storage_err)?;

        rows.into_iter()
            .map(|row| {
                let ts_raw: String = row.get("ts_utc");
                let severity_raw: String = row.get("severity");
                Ok(TaskLog {
                    task_id,
                    ts_utc: parse_timestamp(&ts_raw)?,
                    severity: LogSeverity::parse(&severity_raw).ok_or_else(|| {
                        QueueError::StorageUnavailable(format!(
                            "unknown log severity '{severity_raw}'"
                        ))
                    })?,
                    message: row.get("message"),
                })
            })
            .collect()
    }
}
