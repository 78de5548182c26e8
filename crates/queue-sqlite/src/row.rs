//! Row <-> domain conversion.

use chrono::{DateTime, Utc};
use queue_core::{QueueError, Task, TaskStatus};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueueError::StorageUnavailable(format!("corrupt timestamp '{raw}': {e}")))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>, QueueError> {
    raw.map(|s| parse_timestamp(&s)).transpose()
}

fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

pub(crate) fn row_to_task(row: &SqliteRow) -> Result<Task, QueueError> {
    let status_str: String = row.get("status");
    let status = TaskStatus::parse(&status_str)
        .ok_or_else(|| QueueError::StorageUnavailable(format!("unknown status '{status_str}'")))?;

    Ok(Task {
        id: row.get("id"),
        task_type: row.get("task_type"),
        priority: row.get("priority"),
        status,
        payload: parse_json(&row.get::<String, _>("payload")),
        compatibility: parse_json(&row.get::<String, _>("compatibility")),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        run_after_utc: parse_optional_timestamp(row.get("run_after_utc"))?,
        created_at_utc: parse_timestamp(&row.get::<String, _>("created_at_utc"))?,
        processing_started_utc: parse_optional_timestamp(row.get("processing_started_utc"))?,
        finished_at_utc: parse_optional_timestamp(row.get("finished_at_utc"))?,
        locked_by: row.get("locked_by"),
        lease_expires_utc: parse_optional_timestamp(row.get("lease_expires_utc"))?,
        error_message: row.get("error_message"),
        idempotency_key: row.get("idempotency_key"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
    })
}

pub(crate) fn storage_err(e: sqlx::Error) -> QueueError {
    QueueError::StorageUnavailable(e.to_string())
}
