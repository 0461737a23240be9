//! Database schema initialization

use sqlx::SqlitePool;

use crate::entities::EntityType;
use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    for entity_type in EntityType::ALL {
        sqlx::query(&entity_table_sql(entity_type))
            .execute(pool)
            .await?;
    }

    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

/// Every syncable table has the same shape; only the name differs
fn entity_table_sql(entity_type: EntityType) -> String {
    let table = entity_type.table();
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL UNIQUE,
    version INTEGER NOT NULL DEFAULT 1,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT,
    change_seq INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{table}_change_seq ON {table}(change_seq);
"#
    )
}

const SCHEMA_SQL: &str = r#"
-- Create idempotency keys, scoped per entity type
CREATE TABLE IF NOT EXISTS idempotency_keys (
    entity_type TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    entity_id INTEGER,
    created_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, idempotency_key)
);

-- Server-wide change counter; one row
CREATE TABLE IF NOT EXISTS sync_sequence (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO sync_sequence (id, value) VALUES (1, 0);

-- One row per applied change attempt
CREATE TABLE IF NOT EXISTS sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_ref TEXT NOT NULL,
    operation TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_log_device ON sync_log(device_id);
CREATE INDEX IF NOT EXISTS idx_sync_log_created ON sync_log(created_at);
"#;
