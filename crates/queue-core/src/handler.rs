//! The seam between the queue core and host-supplied work.
//!
//! `TaskHandler` dispatches by `task.type` and is otherwise agnostic to what
//! a handler does. Handlers are injected by the host application; none ship
//! in this crate (see the `task-handlers` demo crate for the echo/sleep
//! examples used by the seed scenarios).

use crate::task::Task;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute one attempt of `task`. Any `Err` is recorded verbatim in
    /// `error_message` and triggers retry or dead-lettering.
    async fn handle(&self, task: &Task, ctx: HandlerContext) -> anyhow::Result<()>;
}

/// Context handed to a handler on each invocation. Carries the cooperative
/// cancellation signal; a handler that never checks it simply runs until
/// the lease expires.
#[derive(Clone)]
pub struct HandlerContext {
    pub cancellation: CancellationToken,
}

/// Polled, not pushed: the worker engine flips this when it observes
/// `cancel_requested` at a lease-renewal boundary. Checking it is always
/// optional for a handler.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// A `HashMap<type, handler>` lookup, one entry per registered task type.
pub type HandlerRegistry = std::collections::HashMap<String, Arc<dyn TaskHandler>>;
