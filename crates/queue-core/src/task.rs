//! Domain model: the persistent `Task` state machine and its supporting types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Monotonically assigned, storage-wide unique task identifier.
pub type TaskId = i64;

/// One of the six states a task can occupy. Terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    DeadLetter,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition further; `finished_at_utc` is set exactly
    /// when a task enters one of these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Failed
                | TaskStatus::DeadLetter
                | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => TaskStatus::Queued,
            "processing" => TaskStatus::Processing,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            "dead_letter" => TaskStatus::DeadLetter,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }
}

/// A persistent task record, as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub payload: Value,
    pub compatibility: Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_after_utc: Option<DateTime<Utc>>,
    pub created_at_utc: DateTime<Utc>,
    pub processing_started_utc: Option<DateTime<Utc>>,
    pub finished_at_utc: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lease_expires_utc: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub cancel_requested: bool,
}

/// Parameters accepted by [`crate::store::TaskStore::enqueue`].
///
/// Priority and max_attempts are validated by the store (`priority` in
/// `1..=1000`, `max_attempts` in `1..=10`) rather than here, so that a single
/// `ValidationError` path covers both the in-process and HTTP callers.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub priority: i32,
    pub payload: Value,
    pub compatibility: Value,
    pub max_attempts: i32,
    pub run_after_utc: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            priority: 100,
            payload: Value::Object(Default::default()),
            compatibility: Value::Object(Default::default()),
            max_attempts: 5,
            run_after_utc: None,
            idempotency_key: None,
        }
    }
}

/// Severity of a [`TaskLog`] entry. Mirrors the `tracing` level names the
/// rest of the crate logs at, since a `TaskLog` row is the persisted,
/// per-task counterpart of a `tracing` event (spec.md §3 "TaskLog").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
}

impl LogSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            LogSeverity::Info => "info",
            LogSeverity::Warn => "warn",
            LogSeverity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "info" => LogSeverity::Info,
            "warn" => LogSeverity::Warn,
            "error" => LogSeverity::Error,
            _ => return None,
        })
    }
}

/// An append-only audit record correlating a task id with a timestamped
/// message (spec.md §3 "TaskLog"). Not on the claim hot path — written by
/// the worker engine at finalize/reclaim boundaries, read back for
/// operator diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub task_id: TaskId,
    pub ts_utc: DateTime<Utc>,
    pub severity: LogSeverity,
    pub message: String,
}

/// Aggregate counters returned by `stats()`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub total: i64,
    pub queued: i64,
    pub processing: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub cancelled: i64,
    pub oldest_queued_age_seconds: Option<f64>,
}

/// A task is eligible for a worker iff every key in `compatibility` has an
/// equal value in the worker's `capabilities`. Both are opaque tag-value
/// maps; non-object values (or a missing key) never match.
pub fn is_compatible(compatibility: &Value, capabilities: &Value) -> bool {
    let Some(required) = compatibility.as_object() else {
        return true;
    };
    if required.is_empty() {
        return true;
    }
    let Some(provided) = capabilities.as_object() else {
        return false;
    };
    required
        .iter()
        .all(|(key, value)| provided.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_compatibility_matches_everything() {
        assert!(is_compatible(&json!({}), &json!({})));
        assert!(is_compatible(&json!({}), &json!({"region": "us-west"})));
    }

    #[test]
    fn matching_subset_is_compatible() {
        let compat = json!({"region": "us-west"});
        let caps = json!({"region": "us-west", "gpu": true});
        assert!(is_compatible(&compat, &caps));
    }

    #[test]
    fn mismatched_value_is_incompatible() {
        let compat = json!({"region": "us-west"});
        let caps = json!({"region": "eu-central"});
        assert!(!is_compatible(&compat, &caps));
    }

    #[test]
    fn missing_key_is_incompatible() {
        let compat = json!({"region": "us-west"});
        let caps = json!({"gpu": true});
        assert!(!is_compatible(&compat, &caps));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::DeadLetter.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }
}
