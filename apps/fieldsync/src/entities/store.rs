//! Authoritative entity storage
//!
//! One repository serves all five entity tables. It borrows a connection
//! (normally an open transaction) so a whole change can be applied inside a
//! single short transaction scoped to one row.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;

use super::types::{format_timestamp, parse_timestamp, EntityType, SyncableEntity};
use crate::error::{AppError, Result};

/// Repository for syncable entity rows
pub struct EntityRepository<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> EntityRepository<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Get an entity by server id
    pub async fn get(&mut self, entity_type: EntityType, id: i64) -> Result<Option<SyncableEntity>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            ENTITY_COLUMNS,
            entity_type.table()
        );

        let row = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;

        row.map(|r| r.into_entity(entity_type)).transpose()
    }

    /// Get an entity by its client-generated id
    pub async fn get_by_client_id(
        &mut self,
        entity_type: EntityType,
        client_id: &str,
    ) -> Result<Option<SyncableEntity>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE client_id = ?",
            ENTITY_COLUMNS,
            entity_type.table()
        );

        let row = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(client_id)
            .fetch_optional(&mut *self.conn)
            .await?;

        row.map(|r| r.into_entity(entity_type)).transpose()
    }

    /// Insert a new row at version 1
    pub async fn insert(
        &mut self,
        entity_type: EntityType,
        client_id: &str,
        payload: &Value,
        change_seq: i64,
        now: DateTime<Utc>,
    ) -> Result<SyncableEntity> {
        let sql = format!(
            r#"
            INSERT INTO {} (client_id, version, payload, created_at, updated_at, deleted_at, change_seq)
            VALUES (?, 1, ?, ?, ?, NULL, ?)
            "#,
            entity_type.table()
        );
        let now = format_timestamp(&now);

        let result = sqlx::query(&sql)
            .bind(client_id)
            .bind(serde_json::to_string(payload)?)
            .bind(&now)
            .bind(&now)
            .bind(change_seq)
            .execute(&mut *self.conn)
            .await?;

        let id = result.last_insert_rowid();
        self.get(entity_type, id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Failed to fetch inserted {}", entity_type)))
    }

    /// Write a new state only if the stored version still equals `expected_version`.
    ///
    /// Returns false when another writer got there first. On success the
    /// version is incremented by exactly one.
    pub async fn compare_and_set(
        &mut self,
        entity_type: EntityType,
        id: i64,
        expected_version: i64,
        update: &RowUpdate<'_>,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET version = version + 1,
                payload = ?,
                updated_at = ?,
                deleted_at = ?,
                change_seq = ?
            WHERE id = ? AND version = ?
            "#,
            entity_type.table()
        );

        let result = sqlx::query(&sql)
            .bind(serde_json::to_string(update.payload)?)
            .bind(format_timestamp(&update.updated_at))
            .bind(update.deleted_at.as_ref().map(format_timestamp))
            .bind(update.change_seq)
            .bind(id)
            .bind(expected_version)
            .execute(&mut *self.conn)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// New state for an accepted update or delete
pub struct RowUpdate<'a> {
    pub payload: &'a Value,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub change_seq: i64,
}

/// Allocate the next server-wide change sequence number.
///
/// This is a write, so calling it first in a transaction also takes the
/// database write lock before any row is read.
pub async fn next_change_seq(conn: &mut SqliteConnection) -> Result<i64> {
    let seq = sqlx::query_scalar::<_, i64>(
        "UPDATE sync_sequence SET value = value + 1 WHERE id = 1 RETURNING value",
    )
    .fetch_one(&mut *conn)
    .await?;

    Ok(seq)
}

pub(crate) const ENTITY_COLUMNS: &str =
    "id, client_id, version, payload, created_at, updated_at, deleted_at, change_seq";

#[derive(sqlx::FromRow)]
pub(crate) struct EntityRow {
    pub id: i64,
    pub client_id: String,
    pub version: i64,
    pub payload: String,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    pub change_seq: i64,
}

impl EntityRow {
    pub fn into_entity(self, entity_type: EntityType) -> Result<SyncableEntity> {
        Ok(SyncableEntity {
            entity_type,
            id: self.id,
            client_id: self.client_id,
            version: self.version,
            payload: serde_json::from_str(&self.payload)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted_at: self
                .deleted_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let pool = create_memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = EntityRepository::new(&mut conn);

        let created = repo
            .insert(EntityType::Supplier, "abc", &json!({"name": "Acme"}), 1, Utc::now())
            .await
            .unwrap();
        assert_eq!(created.id, 1);
        assert_eq!(created.version, 1);
        assert!(created.deleted_at.is_none());

        let by_client = repo
            .get_by_client_id(EntityType::Supplier, "abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_client, created);

        // Tables are separate per type
        assert!(repo.get(EntityType::Product, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_matching_version() {
        let pool = create_memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = EntityRepository::new(&mut conn);

        let created = repo
            .insert(EntityType::Product, "p-1", &json!({"name": "Milk"}), 1, Utc::now())
            .await
            .unwrap();

        let payload = json!({"name": "Whole milk"});
        let update = RowUpdate {
            payload: &payload,
            updated_at: Utc::now(),
            deleted_at: None,
            change_seq: 2,
        };

        assert!(!repo
            .compare_and_set(EntityType::Product, created.id, 7, &update)
            .await
            .unwrap());
        assert!(repo
            .compare_and_set(EntityType::Product, created.id, 1, &update)
            .await
            .unwrap());
        // The same base version cannot win twice
        assert!(!repo
            .compare_and_set(EntityType::Product, created.id, 1, &update)
            .await
            .unwrap());

        let stored = repo.get(EntityType::Product, created.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.payload["name"], "Whole milk");
    }

    #[tokio::test]
    async fn test_change_seq_is_strictly_increasing() {
        let pool = create_memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let first = next_change_seq(&mut conn).await.unwrap();
        let second = next_change_seq(&mut conn).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
