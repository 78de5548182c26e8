//! # queue-core
//!
//! The hard part of a durable task queue: the persisted task state
//! machine, the atomic claim protocol, lease renewal and reclamation of
//! abandoned work, retry policy with backoff and dead-lettering, and four
//! pluggable scheduling strategies.
//!
//! ## Architecture
//!
//! ```text
//! Producer ──enqueue()──► TaskStore ──► row lands `queued`
//!                                         │
//!                              WorkerEngine.run() loop
//!                                         │
//!                    heartbeat ─► Scheduler.pick_candidate() ─► TaskStore.claim()
//!                                         │
//!                              queued -> processing (atomic)
//!                                         │
//!                              TaskHandler.handle()
//!                                         │
//!                    succeeded / failed+retry / dead_letter / cancelled
//! ```
//!
//! ## Key invariants
//!
//! 1. `status = processing` iff `locked_by` and `lease_expires_utc` are set.
//! 2. Terminal states never transition further.
//! 3. `attempts <= max_attempts`; exceeding it dead-letters instead of retrying.
//! 4. A duplicate `idempotency_key` on a non-terminal task is a no-op.
//! 5. `pick_candidate` never locks — only `TaskStore::claim` does, and it is
//!    the sole place at-most-one-claimant is enforced.
//!
//! This crate is storage-agnostic: it is built against the [`TaskStore`]
//! trait, not any particular database. See `queue-sqlite` for the
//! production implementation.

mod backoff;
mod engine;
mod error;
mod handler;
mod scheduler;
mod store;
mod task;
mod worker;

pub use backoff::compute_delay;
pub use engine::{spawn_reclaimer, WorkerEngine, WorkerEngineConfig};
pub use error::{Categorizable, QueueError, SafeErrorCategory};
pub use handler::{CancellationToken, HandlerContext, HandlerRegistry, TaskHandler};
pub use scheduler::{FifoScheduler, LifoScheduler, PriorityScheduler, Scheduler, WeightedRandomScheduler};
pub use store::{CandidateOrder, CandidateSource, CandidateTask, EnqueueOutcome, TaskStore};
pub use task::{is_compatible, LogSeverity, NewTask, QueueStats, Task, TaskId, TaskLog, TaskStatus};
pub use worker::{WorkerId, WorkerInfo, WorkerStatus};

pub use async_trait::async_trait;
