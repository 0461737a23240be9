//! Sync checkpoint storage

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::ClientResult;
use crate::entities::{format_timestamp, parse_timestamp};

const PULL_CURSOR: &str = "pull_cursor";
const LAST_PULL_AT: &str = "last_pull_at";

pub struct SyncStateRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SyncStateRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Cursor returned by the last applied pull page
    pub async fn cursor(&self) -> ClientResult<Option<String>> {
        self.get(PULL_CURSOR).await
    }

    pub async fn last_pull_at(&self) -> ClientResult<Option<DateTime<Utc>>> {
        let value = self.get(LAST_PULL_AT).await?;
        Ok(value.as_deref().map(parse_timestamp).transpose()?)
    }

    async fn get(&self, key: &str) -> ClientResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool)
            .await?;
        Ok(value)
    }
}

/// Store the cursor in the transaction that applied its page
pub(crate) async fn save_cursor_in(
    conn: &mut SqliteConnection,
    cursor: &str,
    now: DateTime<Utc>,
) -> ClientResult<()> {
    let now = format_timestamp(&now);
    set_in(conn, PULL_CURSOR, cursor, &now).await?;
    set_in(conn, LAST_PULL_AT, &now, &now).await
}

async fn set_in(conn: &mut SqliteConnection, key: &str, value: &str, now: &str) -> ClientResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
