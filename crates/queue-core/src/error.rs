//! Error taxonomy for the queue core.
//!
//! Splits a typed error enum from a `Categorizable` trait that says whether
//! an error is safe to surface to an external caller verbatim, or must be
//! flattened to a generic message.

use crate::task::TaskId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("idempotency conflict: existing task {0}")]
    IdempotencyConflict(TaskId),

    #[error("lease lost for task {0}")]
    LeaseLost(TaskId),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("schema mismatch: on-disk version {on_disk} is newer than supported version {supported}")]
    SchemaMismatch { on_disk: i64, supported: i64 },

    #[error("handler error: {0}")]
    Handler(String),
}

/// Whether an error's message is safe to return to an external caller, or
/// must be replaced with a generic message before crossing the HTTP
/// boundary. Validation/lookup failures describe caller mistakes; storage
/// and schema failures can leak internal detail (file paths, SQL text).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    ClientSafe,
    Internal,
}

pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

impl Categorizable for QueueError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            QueueError::Validation(_)
            | QueueError::NotFound(_)
            | QueueError::IdempotencyConflict(_)
            | QueueError::LeaseLost(_) => SafeErrorCategory::ClientSafe,
            QueueError::StorageUnavailable(_)
            | QueueError::SchemaMismatch { .. }
            | QueueError::Handler(_) => SafeErrorCategory::Internal,
        }
    }
}
