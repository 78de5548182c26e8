//! Owns the SQLite file, WAL pragmas, and the reader/writer pool split.
//!
//! Spec §4.1: "readers do not block writers" and "cap concurrent write
//! connections to 1". WAL mode makes the first true; a single-connection
//! writer pool makes the second true without relying on callers to
//! coordinate `BEGIN IMMEDIATE` themselves.

use crate::migrations::{SCHEMA_SQL, SCHEMA_VERSION};
use queue_core::QueueError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) writer: SqlitePool,
    pub(crate) reader: SqlitePool,
}

impl SqliteStorage {
    /// Opens (creating if missing) the database at `path`, applies
    /// durability pragmas, runs the schema, and checks the schema version.
    pub async fn connect(path: &str) -> Result<Self, QueueError> {
        let connect_opts = SqliteConnectOptions::from_str(path)
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_opts.clone())
            .await
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        let reader = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(connect_opts)
            .await
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        let storage = Self { writer, reader };
        storage.run_migrations().await?;
        storage.check_schema_version().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.writer)
            .await
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        let row_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_meta")
            .fetch_one(&self.writer)
            .await
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;

        if row_count == 0 {
            sqlx::query("INSERT INTO schema_meta (version) VALUES (?1)")
                .bind(SCHEMA_VERSION)
                .execute(&self.writer)
                .await
                .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;
        }

        Ok(())
    }

    async fn check_schema_version(&self) -> Result<(), QueueError> {
        let row = sqlx::query("SELECT version FROM schema_meta LIMIT 1")
            .fetch_one(&self.writer)
            .await
            .map_err(|e| QueueError::StorageUnavailable(e.to_string()))?;
        let on_disk: i64 = row.get("version");

        if on_disk > SCHEMA_VERSION {
            return Err(QueueError::SchemaMismatch {
                on_disk,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}
