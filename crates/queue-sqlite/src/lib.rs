//! SQLite-backed [`queue_core::TaskStore`].
//!
//! Layout mirrors the core crate: [`migrations`] owns the embedded schema,
//! [`storage`] owns the connection pools and pragmas, [`row`] converts
//! between `SqliteRow` and the domain `Task`, and [`repository`] implements
//! the actual `TaskStore` / `CandidateSource` traits against them.

mod migrations;
mod repository;
mod row;
mod storage;

pub use migrations::SCHEMA_VERSION;
pub use storage::SqliteStorage;
