//! Conflict inbox
//!
//! Conflicts reported by the server wait here until the user picks a
//! strategy. By the time a record lands here the replica already holds the
//! server's state, so keeping the server version is just a dismissal.
//! Retrying client-wins turns the record back into an ordinary outbox entry
//! based on the latest server version the device knows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

use super::replica;
use super::{ClientError, ClientResult};
use crate::entities::{format_timestamp, parse_timestamp};
use crate::sync::{ConflictReason, ConflictRecord, OperationType, ResolutionStrategy};

/// A conflict record waiting for resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConflict {
    pub id: i64,
    pub record: ConflictRecord,
    pub created_at: DateTime<Utc>,
}

pub struct ConflictInbox<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConflictInbox<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Unresolved conflicts, oldest first
    pub async fn list(&self) -> ClientResult<Vec<StoredConflict>> {
        let sql = format!("SELECT {} FROM conflict_inbox ORDER BY id ASC", INBOX_COLUMNS);
        let rows = sqlx::query_as::<_, InboxRow>(&sql)
            .fetch_all(self.pool)
            .await?;

        rows.into_iter().map(InboxRow::into_conflict).collect()
    }

    pub async fn get(&self, id: i64) -> ClientResult<Option<StoredConflict>> {
        let mut conn = self.pool.acquire().await?;
        load(&mut conn, id).await
    }

    pub async fn count(&self) -> ClientResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conflict_inbox")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }

    /// Resolve a conflict and remove it from the inbox
    pub async fn resolve(&self, id: i64, strategy: ResolutionStrategy) -> ClientResult<()> {
        let mut tx = self.pool.begin().await?;

        let stored = load(&mut tx, id).await?;
        let Some(conflict) = stored else {
            tx.rollback().await?;
            return Err(ClientError::NotFound(format!("conflict {}", id)));
        };
        let record = &conflict.record;

        if strategy == ResolutionStrategy::RetryClientWins {
            if record.reason == ConflictReason::DeletedOnServer {
                tx.rollback().await?;
                return Err(ClientError::Invalid(format!(
                    "{} {} was deleted on the server and cannot be overridden",
                    record.entity_type, record.client_id
                )));
            }

            // Base version comes from the replica, which holds the latest
            // server state the device has seen.
            let payload = match record.operation {
                OperationType::Delete => serde_json::Value::Null,
                _ => record.client_payload.clone(),
            };
            let applied = replica::apply_mutation(
                &mut tx,
                record.entity_type,
                &record.client_id,
                record.operation,
                payload,
                Utc::now(),
            )
            .await;
            if let Err(e) = applied {
                tx.rollback().await?;
                return Err(e);
            }
        }

        sqlx::query("DELETE FROM conflict_inbox WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            conflict_id = id,
            entity_type = %record.entity_type,
            client_id = %record.client_id,
            strategy = strategy.as_str(),
            "Resolved conflict"
        );

        Ok(())
    }
}

pub(crate) async fn insert_in(
    conn: &mut SqliteConnection,
    record: &ConflictRecord,
    now: DateTime<Utc>,
) -> ClientResult<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO conflict_inbox (entity_type, client_id, entity_id, operation, reason,
                                    server_version, server_payload, client_base_version,
                                    client_payload, suggested_strategy, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(record.entity_type.as_str())
    .bind(&record.client_id)
    .bind(record.entity_id)
    .bind(record.operation.as_str())
    .bind(record.reason.as_str())
    .bind(record.server_version)
    .bind(serde_json::to_string(&record.server_payload)?)
    .bind(record.client_base_version)
    .bind(serde_json::to_string(&record.client_payload)?)
    .bind(record.suggested_strategy.as_str())
    .bind(format_timestamp(&now))
    .fetch_one(&mut *conn)
    .await?;

    tracing::warn!(
        conflict_id = id,
        entity_type = %record.entity_type,
        entity_id = record.entity_id,
        reason = record.reason.as_str(),
        "Conflict moved to inbox"
    );

    Ok(id)
}

async fn load(conn: &mut SqliteConnection, id: i64) -> ClientResult<Option<StoredConflict>> {
    let sql = format!("SELECT {} FROM conflict_inbox WHERE id = ?", INBOX_COLUMNS);
    let row = sqlx::query_as::<_, InboxRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(InboxRow::into_conflict).transpose()
}

const INBOX_COLUMNS: &str = "id, entity_type, client_id, entity_id, operation, reason, \
    server_version, server_payload, client_base_version, client_payload, suggested_strategy, created_at";

#[derive(sqlx::FromRow)]
struct InboxRow {
    id: i64,
    entity_type: String,
    client_id: String,
    entity_id: i64,
    operation: String,
    reason: String,
    server_version: i64,
    server_payload: String,
    client_base_version: Option<i64>,
    client_payload: String,
    suggested_strategy: String,
    created_at: String,
}

impl InboxRow {
    fn into_conflict(self) -> ClientResult<StoredConflict> {
        Ok(StoredConflict {
            id: self.id,
            record: ConflictRecord {
                entity_type: self.entity_type.parse().map_err(ClientError::Corrupt)?,
                entity_id: self.entity_id,
                client_id: self.client_id,
                operation: self.operation.parse().map_err(ClientError::Corrupt)?,
                reason: self.reason.parse().map_err(ClientError::Corrupt)?,
                server_version: self.server_version,
                server_payload: serde_json::from_str(&self.server_payload)?,
                client_base_version: self.client_base_version,
                client_payload: serde_json::from_str(&self.client_payload)?,
                suggested_strategy: self
                    .suggested_strategy
                    .parse()
                    .map_err(ClientError::Corrupt)?,
            },
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}
