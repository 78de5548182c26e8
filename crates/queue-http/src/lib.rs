//! Thin `axum` adapter over a [`queue_core::TaskStore`].
//!
//! Handlers call straight into the repository and translate domain errors
//! to the uniform envelope via [`ApiError`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use queue_core::{
    Categorizable, EnqueueOutcome, NewTask, QueueError, QueueStats, SafeErrorCategory, Task,
    TaskId, TaskStatus, TaskStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
}

pub fn router(store: Arc<dyn TaskStore>) -> Router {
    let state = AppState { store };
    Router::new()
        .route("/api/queue/tasks", post(enqueue_task))
        .route("/api/queue/tasks/:id", get(get_task).delete(cancel_task))
        .route("/api/queue/stats", get(get_stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_payload")]
    pub payload: Value,
    #[serde(default = "default_payload")]
    pub compatibility: Value,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    pub run_after_utc: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

fn default_priority() -> i32 {
    100
}

fn default_payload() -> Value {
    Value::Object(Default::default())
}

fn default_max_attempts() -> i32 {
    5
}

impl From<EnqueueRequest> for NewTask {
    fn from(req: EnqueueRequest) -> Self {
        NewTask {
            task_type: req.task_type,
            priority: req.priority,
            payload: req.payload,
            compatibility: req.compatibility,
            max_attempts: req.max_attempts,
            run_after_utc: req.run_after_utc,
            idempotency_key: req.idempotency_key,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub created_at_utc: DateTime<Utc>,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub payload: Value,
    pub compatibility: Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at_utc: DateTime<Utc>,
    pub processing_started_utc: Option<DateTime<Utc>>,
    pub finished_at_utc: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub error_message: Option<String>,
}

impl From<Task> for TaskStatusResponse {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type,
            priority: task.priority,
            status: task.status,
            payload: task.payload,
            compatibility: task.compatibility,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            created_at_utc: task.created_at_utc,
            processing_started_utc: task.processing_started_utc,
            finished_at_utc: task.finished_at_utc,
            locked_by: task.locked_by,
            error_message: task.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelTaskResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    #[serde(flatten)]
    pub stats: QueueStats,
}

async fn enqueue_task(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Response, ApiError> {
    let new_task: NewTask = req.into();
    let outcome = state.store.enqueue_checked(new_task).await?;
    let task = state.store.get_task(outcome.task_id()).await?;

    let (status, message) = match outcome {
        EnqueueOutcome::Created(_) => (StatusCode::CREATED, "task enqueued"),
        EnqueueOutcome::Existing(_) => {
            (StatusCode::CONFLICT, "idempotency key already has a non-terminal task")
        }
    };

    let body = Json(EnqueueResponse {
        task_id: task.id,
        status: task.status,
        created_at_utc: task.created_at_utc,
        message,
    });
    Ok((status, body).into_response())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let task = state.store.get_task(id).await?;
    Ok(Json(task.into()))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> Result<Json<CancelTaskResponse>, ApiError> {
    let status = state.store.cancel(id).await?;
    Ok(Json(CancelTaskResponse {
        task_id: id,
        status,
        message: "cancellation recorded",
    }))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<QueueStatsResponse>, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(QueueStatsResponse { stats }))
}

/// Uniform `{detail, error_code, timestamp}` envelope for every error the
/// adapter can return. Internal-category errors have their detail replaced
/// with a generic message before crossing the wire.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_code: &'static str,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, error_code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            error_code,
            detail: detail.into(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let (status, error_code) = match &err {
            QueueError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            QueueError::NotFound(_) => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND"),
            QueueError::IdempotencyConflict(_) => (StatusCode::CONFLICT, "IDEMPOTENCY_CONFLICT"),
            QueueError::LeaseLost(_) => (StatusCode::CONFLICT, "LEASE_LOST"),
            QueueError::StorageUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
            }
            QueueError::SchemaMismatch { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
            }
            QueueError::Handler(_) => (StatusCode::INTERNAL_SERVER_ERROR, "HANDLER_ERROR"),
        };

        let detail = match err.category() {
            SafeErrorCategory::ClientSafe => err.to_string(),
            SafeErrorCategory::Internal => {
                tracing::warn!(event = "http.error.internal", error = %err, "internal error crossing http boundary");
                "an internal error occurred".to_string()
            }
        };

        ApiError::new(status, error_code, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "detail": self.detail,
            "error_code": self.error_code,
            "timestamp": Utc::now(),
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use queue_testing::in_memory_store;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_fetch_round_trips() {
        let app = router(in_memory_store());

        let request = Request::builder()
            .method("POST")
            .uri("/api/queue/tasks")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"type": "echo"}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        let task_id = body["task_id"].as_i64().unwrap();

        let request = Request::builder()
            .method("GET")
            .uri(format!("/api/queue/tasks/{task_id}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "queued");
    }

    #[tokio::test]
    async fn missing_task_returns_404_envelope() {
        let app = router(in_memory_store());
        let request = Request::builder()
            .method("GET")
            .uri("/api/queue/tasks/999")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "TASK_NOT_FOUND");
        assert!(body["detail"].is_string());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn empty_type_is_rejected_as_validation_error() {
        let app = router(in_memory_store());
        let request = Request::builder()
            .method("POST")
            .uri("/api/queue/tasks")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"type": ""}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_409_with_existing_id() {
        let app = router(in_memory_store());
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/api/queue/tasks")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"type": "echo", "idempotency_key": "order-1"}"#,
                ))
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let first_body = body_json(first).await;
        let first_id = first_body["task_id"].as_i64().unwrap();

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let second_body = body_json(second).await;
        assert_eq!(second_body["task_id"].as_i64().unwrap(), first_id);
    }

    #[tokio::test]
    async fn cancel_then_stats_reflects_it() {
        let app = router(in_memory_store());
        let request = Request::builder()
            .method("POST")
            .uri("/api/queue/tasks")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"type": "echo"}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let body = body_json(response).await;
        let task_id = body["task_id"].as_i64().unwrap();

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/queue/tasks/{task_id}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "cancelled");

        let request = Request::builder()
            .method("GET")
            .uri("/api/queue/stats")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["cancelled"], 1);
    }
}
