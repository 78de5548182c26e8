//! Embedded schema. `task_queue`, `workers`, `task_log`, plus the indexes
//! named in spec §4.1 and a `schema_meta` row the engine checks on open.

pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_queue (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type               TEXT NOT NULL,
    priority                INTEGER NOT NULL,
    status                  TEXT NOT NULL,
    payload                 TEXT NOT NULL,
    compatibility           TEXT NOT NULL,
    attempts                INTEGER NOT NULL DEFAULT 0,
    max_attempts            INTEGER NOT NULL,
    run_after_utc           TEXT,
    created_at_utc          TEXT NOT NULL,
    processing_started_utc  TEXT,
    finished_at_utc         TEXT,
    locked_by               TEXT,
    lease_expires_utc       TEXT,
    error_message           TEXT,
    idempotency_key         TEXT,
    cancel_requested        INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_task_queue_claim
    ON task_queue (status, priority, run_after_utc);

CREATE UNIQUE INDEX IF NOT EXISTS idx_task_queue_idempotency
    ON task_queue (idempotency_key)
    WHERE idempotency_key IS NOT NULL
      AND status NOT IN ('succeeded', 'failed', 'dead_letter', 'cancelled');

CREATE INDEX IF NOT EXISTS idx_task_queue_lease
    ON task_queue (locked_by, lease_expires_utc);

CREATE TABLE IF NOT EXISTS workers (
    id                  TEXT PRIMARY KEY,
    capabilities        TEXT NOT NULL,
    last_heartbeat_utc  TEXT NOT NULL,
    status              TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_log (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id   INTEGER NOT NULL,
    ts_utc    TEXT NOT NULL,
    severity  TEXT NOT NULL,
    message   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_log_task_id ON task_log (task_id);
"#;
