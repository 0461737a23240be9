//! Local database schema

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use super::ClientResult;

/// Open (or create) the device database at `url`
///
/// The engine serialises its own writes, so one connection is enough.
pub async fn open_local(url: &str) -> ClientResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    initialize_local_schema(&pool).await?;

    Ok(pool)
}

/// In-memory device database, mainly for tests
pub async fn open_local_in_memory() -> ClientResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    initialize_local_schema(&pool).await?;

    Ok(pool)
}

pub async fn initialize_local_schema(pool: &SqlitePool) -> ClientResult<()> {
    sqlx::query(LOCAL_SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

const LOCAL_SCHEMA_SQL: &str = r#"
-- Local replica; version is speculative while outbox entries exist
CREATE TABLE IF NOT EXISTS local_entities (
    entity_type TEXT NOT NULL,
    client_id TEXT NOT NULL,
    server_id INTEGER,
    version INTEGER NOT NULL,
    server_version INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    PRIMARY KEY (entity_type, client_id)
);

CREATE INDEX IF NOT EXISTS idx_local_entities_server_id ON local_entities(entity_type, server_id);

-- Mutations awaiting push, in causal order
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_id TEXT NOT NULL UNIQUE,
    entity_type TEXT NOT NULL,
    client_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    base_version INTEGER,
    payload TEXT NOT NULL,
    idempotency_key TEXT,
    client_timestamp TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, id);
CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox(entity_type, client_id, id);

-- Conflicts waiting for a user decision
CREATE TABLE IF NOT EXISTS conflict_inbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    client_id TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    operation TEXT NOT NULL,
    reason TEXT NOT NULL,
    server_version INTEGER NOT NULL,
    server_payload TEXT NOT NULL,
    client_base_version INTEGER,
    client_payload TEXT NOT NULL,
    suggested_strategy TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conflict_inbox_entity ON conflict_inbox(entity_type, client_id);

CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;
