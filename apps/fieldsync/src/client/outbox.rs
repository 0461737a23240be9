//! Outbox of local mutations awaiting push
//!
//! Entries are kept in insertion order, which is the causal order the user
//! made the changes in. Only the oldest unresolved entry of an entity is
//! ever sent, so a batch carries at most one entry per entity; entries for
//! different entities go out independently.
//!
//! Later entries for an entity were made on top of its speculative local
//! version. When an earlier entry conflicts they move to the inbox with it,
//! since their base versions no longer describe anything the server holds.
//!
//! Lifecycle: `pending` -> `in_flight` during a push, then removed when
//! synced or conflicted (the conflict moves to the inbox), or `failed` with
//! a retry time. Failed entries with no retry time need attention and are
//! only retried after `retry_failed`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use super::{inbox, replica, ClientError, ClientResult};
use crate::entities::{format_timestamp, parse_timestamp, EntityType, SyncableEntity};
use crate::sync::{ChangeRequest, ConflictReason, ConflictRecord, OperationType, ResolutionStrategy};

/// Status of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    Synced,
    Failed,
    Conflicted,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InFlight => "in_flight",
            EntryStatus::Synced => "synced",
            EntryStatus::Failed => "failed",
            EntryStatus::Conflicted => "conflicted",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "in_flight" => Ok(EntryStatus::InFlight),
            "synced" => Ok(EntryStatus::Synced),
            "failed" => Ok(EntryStatus::Failed),
            "conflicted" => Ok(EntryStatus::Conflicted),
            other => Err(format!("unknown outbox status: {}", other)),
        }
    }
}

/// A mutation to append to the outbox
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub entity_type: EntityType,
    pub client_id: String,
    pub operation: OperationType,
    pub base_version: Option<i64>,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

/// A queued local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub change_id: String,
    pub entity_type: EntityType,
    pub client_id: String,
    pub operation: OperationType,
    pub base_version: Option<i64>,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub client_timestamp: DateTime<Utc>,
    pub status: EntryStatus,
    /// Number of times the entry has been sent
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ChangeLogEntry {
    /// Wire form of the entry; `entity_id` is the server id if known by now
    pub fn to_request(&self, entity_id: Option<i64>) -> ChangeRequest {
        ChangeRequest {
            change_id: Some(self.change_id.clone()),
            entity_type: self.entity_type,
            operation: self.operation,
            entity_id,
            client_id: Some(self.client_id.clone()),
            base_version: self.base_version,
            payload: self.payload.clone(),
            idempotency_key: self.idempotency_key.clone(),
            client_timestamp: Some(self.client_timestamp),
        }
    }
}

/// Outbox entries per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: i64,
    pub in_flight: i64,
    /// Failed entries that will be retried automatically
    pub failed: i64,
    /// Failed entries that will not be retried without user action
    pub exhausted: i64,
}

/// Repository for the outbox
pub struct Outbox<'a> {
    pool: &'a SqlitePool,
}

impl<'a> Outbox<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an entry
    pub async fn enqueue(&self, change: &NewChange) -> ClientResult<ChangeLogEntry> {
        let mut conn = self.pool.acquire().await?;
        enqueue_in(&mut conn, change, Utc::now()).await
    }

    /// Take up to `max` sendable entries in causal order and mark them in flight.
    ///
    /// An entry is sendable when it is pending or its retry time has passed,
    /// and it is the oldest entry still queued for its entity.
    pub async fn dequeue_batch(
        &self,
        max: usize,
        now: DateTime<Utc>,
    ) -> ClientResult<Vec<ChangeLogEntry>> {
        let now = format_timestamp(&now);
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            SELECT {columns} FROM outbox o
            WHERE {sendable}
              AND NOT EXISTS (
                SELECT 1 FROM outbox e
                WHERE e.entity_type = o.entity_type
                  AND e.client_id = o.client_id
                  AND e.id < o.id
              )
            ORDER BY o.id ASC
            LIMIT ?
            "#,
            columns = OUTBOX_COLUMNS_O,
            sendable = sendable_clause("o"),
        );

        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(&now)
            .bind(i64::try_from(max).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            sqlx::query(
                "UPDATE outbox SET status = 'in_flight', attempts = attempts + 1 WHERE id = ?",
            )
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

            let mut entry = row.into_entry()?;
            entry.status = EntryStatus::InFlight;
            entry.attempts += 1;
            entries.push(entry);
        }

        tx.commit().await?;
        Ok(entries)
    }

    /// Remove an acknowledged entry and fold the server's state into the replica
    pub async fn mark_synced(&self, entry_id: i64, confirmed: &SyncableEntity) -> ClientResult<()> {
        let mut tx = self.pool.begin().await?;
        delete_in(&mut tx, entry_id).await?;
        replica::upsert_from_server_in(&mut tx, confirmed).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Record a failure; `retry_at` of `None` parks the entry until `retry_failed`
    pub async fn mark_failed(
        &self,
        entry_id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> ClientResult<()> {
        sqlx::query(
            "UPDATE outbox SET status = 'failed', last_error = ?, next_attempt_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(retry_at.as_ref().map(format_timestamp))
        .bind(entry_id)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Move a conflicted entry into the conflict inbox and adopt the server state.
    ///
    /// Entries queued behind it for the same entity go to the inbox as well,
    /// each as a conflict against the adopted state. Returns the ids of the
    /// stored conflicts, the answered entry's first.
    pub async fn mark_conflicted(
        &self,
        entry: &ChangeLogEntry,
        record: &ConflictRecord,
        server: &SyncableEntity,
    ) -> ClientResult<Vec<i64>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        delete_in(&mut tx, entry.id).await?;
        let mut conflict_ids = vec![inbox::insert_in(&mut tx, record, now).await?];

        for later in entity_entries_in(&mut tx, entry.entity_type, &entry.client_id).await? {
            delete_in(&mut tx, later.id).await?;
            let stale = stale_conflict(&later, server);
            conflict_ids.push(inbox::insert_in(&mut tx, &stale, now).await?);
        }

        replica::adopt_server_state_in(&mut tx, server).await?;
        tx.commit().await?;

        if conflict_ids.len() > 1 {
            tracing::warn!(
                entity_type = %entry.entity_type,
                client_id = %entry.client_id,
                moved = conflict_ids.len() - 1,
                "Moved queued changes behind a conflict to the inbox"
            );
        }

        Ok(conflict_ids)
    }

    /// Return entries left in flight by an interrupted push to the retry queue
    pub async fn recover_in_flight(&self, now: DateTime<Utc>) -> ClientResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'failed', last_error = 'outcome unknown', next_attempt_at = ?
            WHERE status = 'in_flight'
            "#,
        )
        .bind(format_timestamp(&now))
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Whether an older entry for the same entity is still queued
    pub async fn has_earlier_entry(&self, entry: &ChangeLogEntry) -> ClientResult<bool> {
        let earlier: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM outbox
            WHERE entity_type = ? AND client_id = ? AND id < ?
            "#,
        )
        .bind(entry.entity_type.as_str())
        .bind(&entry.client_id)
        .bind(entry.id)
        .fetch_one(self.pool)
        .await?;

        Ok(earlier > 0)
    }

    /// Turn an update or delete the server has no row for into a create.
    ///
    /// The create carries the full local state and the entity's stable
    /// idempotency key. The replica forgets the server id and version it
    /// held, since the server has no such row. A rewritten delete is followed
    /// by a fresh delete against the version the create will produce.
    pub async fn rewrite_as_create(
        &self,
        entry: &ChangeLogEntry,
        payload: &Value,
    ) -> ClientResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE outbox
            SET operation = 'create', base_version = NULL, payload = ?, idempotency_key = ?,
                status = 'pending', last_error = 'resent as create', next_attempt_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(payload)?)
        .bind(&entry.client_id)
        .bind(entry.id)
        .execute(&mut *tx)
        .await?;
        replica::forget_server_state_in(&mut tx, entry.entity_type, &entry.client_id).await?;

        if entry.operation == OperationType::Delete {
            let delete = NewChange {
                entity_type: entry.entity_type,
                client_id: entry.client_id.clone(),
                operation: OperationType::Delete,
                base_version: Some(1),
                payload: Value::Null,
                idempotency_key: None,
            };
            enqueue_in(&mut tx, &delete, Utc::now()).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Requeue every failed entry, including parked ones
    pub async fn retry_failed(&self) -> ClientResult<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'pending', next_attempt_at = NULL, attempts = 0 WHERE status = 'failed'",
        )
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// All queued entries in causal order
    pub async fn list(&self) -> ClientResult<Vec<ChangeLogEntry>> {
        let sql = format!("SELECT {} FROM outbox o ORDER BY o.id ASC", OUTBOX_COLUMNS_O);
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .fetch_all(self.pool)
            .await?;

        rows.into_iter().map(OutboxRow::into_entry).collect()
    }

    pub async fn counts(&self) -> ClientResult<OutboxCounts> {
        let (pending, in_flight, failed, exhausted): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'in_flight' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' AND next_attempt_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' AND next_attempt_at IS NULL THEN 1 ELSE 0 END), 0)
            FROM outbox
            "#,
        )
        .fetch_one(self.pool)
        .await?;

        Ok(OutboxCounts {
            pending,
            in_flight,
            failed,
            exhausted,
        })
    }
}

fn sendable_clause(alias: &str) -> String {
    format!(
        "({a}.status = 'pending' OR ({a}.status = 'failed' AND {a}.next_attempt_at IS NOT NULL AND {a}.next_attempt_at <= ?))",
        a = alias
    )
}

/// Append an entry on an existing connection or transaction
pub(crate) async fn enqueue_in(
    conn: &mut SqliteConnection,
    change: &NewChange,
    now: DateTime<Utc>,
) -> ClientResult<ChangeLogEntry> {
    let change_id = uuid::Uuid::new_v4().to_string();

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO outbox (change_id, entity_type, client_id, operation, base_version, payload,
                            idempotency_key, client_timestamp, status, attempts)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0)
        RETURNING id
        "#,
    )
    .bind(&change_id)
    .bind(change.entity_type.as_str())
    .bind(&change.client_id)
    .bind(change.operation.as_str())
    .bind(change.base_version)
    .bind(serde_json::to_string(&change.payload)?)
    .bind(&change.idempotency_key)
    .bind(format_timestamp(&now))
    .fetch_one(&mut *conn)
    .await?;

    tracing::debug!(
        entity_type = %change.entity_type,
        client_id = %change.client_id,
        operation = %change.operation,
        outbox_id = id,
        "Enqueued local change"
    );

    Ok(ChangeLogEntry {
        id,
        change_id,
        entity_type: change.entity_type,
        client_id: change.client_id.clone(),
        operation: change.operation,
        base_version: change.base_version,
        payload: change.payload.clone(),
        idempotency_key: change.idempotency_key.clone(),
        client_timestamp: now,
        status: EntryStatus::Pending,
        attempts: 0,
        last_error: None,
        next_attempt_at: None,
    })
}

/// Whether the entity has any entry still queued
pub(crate) async fn has_unsent(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    client_id: &str,
) -> ClientResult<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outbox WHERE entity_type = ? AND client_id = ?",
    )
    .bind(entity_type.as_str())
    .bind(client_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count > 0)
}

/// Queued entries for one entity, oldest first
async fn entity_entries_in(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    client_id: &str,
) -> ClientResult<Vec<ChangeLogEntry>> {
    let sql = format!(
        "SELECT {} FROM outbox o WHERE o.entity_type = ? AND o.client_id = ? ORDER BY o.id ASC",
        OUTBOX_COLUMNS_O
    );
    let rows = sqlx::query_as::<_, OutboxRow>(&sql)
        .bind(entity_type.as_str())
        .bind(client_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter().map(OutboxRow::into_entry).collect()
}

/// Conflict for an entry whose base was made stale by an earlier conflict
fn stale_conflict(entry: &ChangeLogEntry, server: &SyncableEntity) -> ConflictRecord {
    let reason = if server.is_deleted() {
        ConflictReason::DeletedOnServer
    } else {
        ConflictReason::VersionMismatch
    };

    ConflictRecord {
        entity_type: entry.entity_type,
        entity_id: server.id,
        client_id: entry.client_id.clone(),
        operation: entry.operation,
        reason,
        server_version: server.version,
        server_payload: server.payload.clone(),
        client_base_version: entry.base_version,
        client_payload: entry.payload.clone(),
        suggested_strategy: ResolutionStrategy::KeepServer,
    }
}

async fn delete_in(conn: &mut SqliteConnection, entry_id: i64) -> ClientResult<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

const OUTBOX_COLUMNS_O: &str = "o.id, o.change_id, o.entity_type, o.client_id, o.operation, \
    o.base_version, o.payload, o.idempotency_key, o.client_timestamp, o.status, o.attempts, \
    o.last_error, o.next_attempt_at";

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: i64,
    change_id: String,
    entity_type: String,
    client_id: String,
    operation: String,
    base_version: Option<i64>,
    payload: String,
    idempotency_key: Option<String>,
    client_timestamp: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    next_attempt_at: Option<String>,
}

impl OutboxRow {
    fn into_entry(self) -> ClientResult<ChangeLogEntry> {
        Ok(ChangeLogEntry {
            id: self.id,
            change_id: self.change_id,
            entity_type: self.entity_type.parse().map_err(ClientError::Corrupt)?,
            client_id: self.client_id,
            operation: self.operation.parse().map_err(ClientError::Corrupt)?,
            base_version: self.base_version,
            payload: serde_json::from_str(&self.payload)?,
            idempotency_key: self.idempotency_key,
            client_timestamp: parse_timestamp(&self.client_timestamp)?,
            status: self.status.parse().map_err(ClientError::Corrupt)?,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            last_error: self.last_error,
            next_attempt_at: self
                .next_attempt_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::open_local_in_memory;
    use chrono::Duration;
    use serde_json::json;

    fn change(client_id: &str, operation: OperationType, base_version: Option<i64>) -> NewChange {
        NewChange {
            entity_type: EntityType::Supplier,
            client_id: client_id.to_string(),
            operation,
            base_version,
            payload: json!({"name": client_id}),
            idempotency_key: (operation == OperationType::Create).then(|| client_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_dequeue_preserves_order_and_marks_in_flight() {
        let pool = open_local_in_memory().await.unwrap();
        let outbox = Outbox::new(&pool);

        outbox.enqueue(&change("a", OperationType::Create, None)).await.unwrap();
        outbox.enqueue(&change("b", OperationType::Create, None)).await.unwrap();
        outbox.enqueue(&change("a", OperationType::Update, Some(1))).await.unwrap();

        let batch = outbox.dequeue_batch(10, Utc::now()).await.unwrap();
        let order: Vec<(&str, OperationType)> = batch
            .iter()
            .map(|e| (e.client_id.as_str(), e.operation))
            .collect();
        // The update waits until the create ahead of it is settled
        assert_eq!(
            order,
            vec![("a", OperationType::Create), ("b", OperationType::Create)]
        );
        assert!(batch.iter().all(|e| e.status == EntryStatus::InFlight && e.attempts == 1));

        assert!(outbox.dequeue_batch(10, Utc::now()).await.unwrap().is_empty());
        let counts = outbox.counts().await.unwrap();
        assert_eq!(counts.in_flight, 2);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn test_failed_entry_holds_back_later_entries_for_same_entity() {
        let pool = open_local_in_memory().await.unwrap();
        let outbox = Outbox::new(&pool);
        let now = Utc::now();

        outbox.enqueue(&change("a", OperationType::Create, None)).await.unwrap();
        let first = outbox.dequeue_batch(1, now).await.unwrap();
        outbox
            .mark_failed(first[0].id, "timeout", Some(now + Duration::seconds(60)))
            .await
            .unwrap();

        outbox.enqueue(&change("a", OperationType::Update, Some(1))).await.unwrap();
        outbox.enqueue(&change("b", OperationType::Create, None)).await.unwrap();

        let batch = outbox.dequeue_batch(10, now).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].client_id, "b");

        // Once the retry time passes the blocked entity flows again, head first
        let later = outbox
            .dequeue_batch(10, now + Duration::seconds(61))
            .await
            .unwrap();
        let ops: Vec<OperationType> = later.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![OperationType::Create]);
        assert_eq!(later[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_recover_and_retry_failed() {
        let pool = open_local_in_memory().await.unwrap();
        let outbox = Outbox::new(&pool);
        let now = Utc::now();

        outbox.enqueue(&change("a", OperationType::Create, None)).await.unwrap();
        outbox.enqueue(&change("b", OperationType::Create, None)).await.unwrap();
        let batch = outbox.dequeue_batch(10, now).await.unwrap();
        outbox.mark_failed(batch[1].id, "rejected", None).await.unwrap();

        assert_eq!(outbox.recover_in_flight(now).await.unwrap(), 1);
        let counts = outbox.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.exhausted, 1);
        assert_eq!(counts.in_flight, 0);

        // Parked entries are never picked up on their own
        let resend = outbox.dequeue_batch(10, now).await.unwrap();
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].client_id, "a");

        outbox.recover_in_flight(now).await.unwrap();
        assert_eq!(outbox.retry_failed().await.unwrap(), 2);
        assert_eq!(outbox.counts().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_rewrite_delete_as_create_then_delete() {
        let pool = open_local_in_memory().await.unwrap();
        let outbox = Outbox::new(&pool);

        let entry = outbox
            .enqueue(&change("a", OperationType::Delete, Some(3)))
            .await
            .unwrap();
        assert!(!outbox.has_earlier_entry(&entry).await.unwrap());

        outbox
            .rewrite_as_create(&entry, &json!({"name": "full"}))
            .await
            .unwrap();

        let entries = outbox.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, OperationType::Create);
        assert_eq!(entries[0].base_version, None);
        assert_eq!(entries[0].idempotency_key.as_deref(), Some("a"));
        assert_eq!(entries[0].payload, json!({"name": "full"}));
        assert_eq!(entries[1].operation, OperationType::Delete);
        assert_eq!(entries[1].base_version, Some(1));
        assert!(outbox.has_earlier_entry(&entries[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_conflict_takes_queued_entries_for_entity_along() {
        let pool = open_local_in_memory().await.unwrap();
        let outbox = Outbox::new(&pool);

        let first = outbox
            .enqueue(&change("a", OperationType::Update, Some(1)))
            .await
            .unwrap();
        outbox.enqueue(&change("a", OperationType::Update, Some(2))).await.unwrap();
        outbox.enqueue(&change("b", OperationType::Update, Some(1))).await.unwrap();
        let batch = outbox.dequeue_batch(10, Utc::now()).await.unwrap();
        assert_eq!(batch.len(), 2);

        let server = SyncableEntity {
            entity_type: EntityType::Supplier,
            id: 1,
            client_id: "a".to_string(),
            version: 2,
            payload: json!({"name": "other device"}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        let record = stale_conflict(&batch[0], &server);
        let ids = outbox.mark_conflicted(&first, &record, &server).await.unwrap();
        assert_eq!(ids.len(), 2);

        // Only b's entry is left
        let remaining = outbox.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].client_id, "b");

        let stored = inbox::ConflictInbox::new(&pool).list().await.unwrap();
        let bases: Vec<Option<i64>> = stored.iter().map(|c| c.record.client_base_version).collect();
        assert_eq!(bases, vec![Some(1), Some(2)]);
        assert!(stored.iter().all(|c| c.record.server_version == 2));

        let local = replica::ReplicaRepository::new(&pool)
            .get_by_client_id(EntityType::Supplier, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.version, 2);
        assert_eq!(local.payload, json!({"name": "other device"}));
        assert!(!local.dirty);
    }

    #[tokio::test]
    async fn test_entry_to_request_carries_correlation() {
        let pool = open_local_in_memory().await.unwrap();
        let entry = Outbox::new(&pool)
            .enqueue(&change("a", OperationType::Update, Some(4)))
            .await
            .unwrap();

        let request = entry.to_request(Some(17));
        assert_eq!(request.change_id.as_deref(), Some(entry.change_id.as_str()));
        assert_eq!(request.entity_id, Some(17));
        assert_eq!(request.client_id.as_deref(), Some("a"));
        assert_eq!(request.base_version, Some(4));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            EntryStatus::Pending,
            EntryStatus::InFlight,
            EntryStatus::Synced,
            EntryStatus::Failed,
            EntryStatus::Conflicted,
        ] {
            assert_eq!(status.as_str().parse::<EntryStatus>(), Ok(status));
        }
    }
}
