//! Local entity replica
//!
//! The device's copy of every entity it has seen or created. Local
//! mutations land here first and are immediately visible; each one also
//! appends an outbox entry in the same transaction.
//!
//! `version` is speculative: it runs ahead of `server_version` by the
//! number of local changes not yet acknowledged. While an entity has queued
//! changes, server rows from a pull only refresh its server fields; the
//! local edits stay visible until their push succeeds or conflicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use super::outbox::{self, NewChange};
use super::{ClientError, ClientResult};
use crate::entities::{
    format_timestamp, merge_payload, parse_timestamp, EntityType, SyncableEntity,
};
use crate::sync::{JsonObjectValidator, OperationType, PayloadValidator};

/// An entity as the device sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub entity_type: EntityType,
    pub client_id: String,
    /// Server id, once the server has acknowledged the create
    pub server_id: Option<i64>,
    pub version: i64,
    /// Last version confirmed by the server
    pub server_version: i64,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Local changes are waiting in the outbox
    pub dirty: bool,
}

impl LocalEntity {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Repository for the local replica
pub struct ReplicaRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ReplicaRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get an entity by its server id
    pub async fn get(&self, entity_type: EntityType, id: i64) -> ClientResult<Option<LocalEntity>> {
        let sql = format!(
            "SELECT {} FROM local_entities l WHERE l.entity_type = ? AND l.server_id = ?",
            LOCAL_COLUMNS
        );
        let row = sqlx::query_as::<_, LocalRow>(&sql)
            .bind(entity_type.as_str())
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        row.map(LocalRow::into_entity).transpose()
    }

    pub async fn get_by_client_id(
        &self,
        entity_type: EntityType,
        client_id: &str,
    ) -> ClientResult<Option<LocalEntity>> {
        let mut conn = self.pool.acquire().await?;
        load(&mut conn, entity_type, client_id).await
    }

    /// Live (not deleted) entities of one type
    pub async fn list(&self, entity_type: EntityType) -> ClientResult<Vec<LocalEntity>> {
        let sql = format!(
            r#"
            SELECT {} FROM local_entities l
            WHERE l.entity_type = ? AND l.deleted_at IS NULL
            ORDER BY l.updated_at ASC, l.client_id ASC
            "#,
            LOCAL_COLUMNS
        );
        let rows = sqlx::query_as::<_, LocalRow>(&sql)
            .bind(entity_type.as_str())
            .fetch_all(self.pool)
            .await?;

        rows.into_iter().map(LocalRow::into_entity).collect()
    }

    /// Fold a server row into the replica
    pub async fn upsert_from_server(&self, entity: &SyncableEntity) -> ClientResult<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_from_server_in(&mut conn, entity).await
    }

    /// Overwrite local state with the server's, discarding speculative edits
    pub async fn adopt_server_state(&self, entity: &SyncableEntity) -> ClientResult<()> {
        let mut conn = self.pool.acquire().await?;
        adopt_server_state_in(&mut conn, entity).await
    }

    /// Apply a mutation locally and queue it for push
    pub async fn apply_local_mutation(
        &self,
        entity_type: EntityType,
        client_id: &str,
        operation: OperationType,
        payload: Value,
    ) -> ClientResult<LocalEntity> {
        let mut tx = self.pool.begin().await?;
        let entity = apply_mutation(&mut tx, entity_type, client_id, operation, payload, Utc::now())
            .await?;
        tx.commit().await?;

        Ok(entity)
    }
}

pub(crate) async fn load(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    client_id: &str,
) -> ClientResult<Option<LocalEntity>> {
    let sql = format!(
        "SELECT {} FROM local_entities l WHERE l.entity_type = ? AND l.client_id = ?",
        LOCAL_COLUMNS
    );
    let row = sqlx::query_as::<_, LocalRow>(&sql)
        .bind(entity_type.as_str())
        .bind(client_id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(LocalRow::into_entity).transpose()
}

/// Upsert a server row.
///
/// Idempotent: the same row applied twice leaves the replica unchanged.
/// Rows older than what the replica already knows are ignored.
pub(crate) async fn upsert_from_server_in(
    conn: &mut SqliteConnection,
    entity: &SyncableEntity,
) -> ClientResult<()> {
    let current = load(conn, entity.entity_type, &entity.client_id).await?;

    if let Some(local) = &current {
        if local.server_version > entity.version {
            return Ok(());
        }

        if outbox::has_unsent(conn, entity.entity_type, &entity.client_id).await? {
            sqlx::query(
                r#"
                UPDATE local_entities
                SET server_id = ?, server_version = MAX(server_version, ?)
                WHERE entity_type = ? AND client_id = ?
                "#,
            )
            .bind(entity.id)
            .bind(entity.version)
            .bind(entity.entity_type.as_str())
            .bind(&entity.client_id)
            .execute(&mut *conn)
            .await?;
            return Ok(());
        }
    }

    adopt_server_state_in(conn, entity).await
}

pub(crate) async fn adopt_server_state_in(
    conn: &mut SqliteConnection,
    entity: &SyncableEntity,
) -> ClientResult<()> {
    sqlx::query(
        r#"
        INSERT INTO local_entities (entity_type, client_id, server_id, version, server_version,
                                    payload, updated_at, deleted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_type, client_id) DO UPDATE SET
            server_id = excluded.server_id,
            version = excluded.version,
            server_version = excluded.server_version,
            payload = excluded.payload,
            updated_at = excluded.updated_at,
            deleted_at = excluded.deleted_at
        WHERE excluded.server_version >= local_entities.server_version
        "#,
    )
    .bind(entity.entity_type.as_str())
    .bind(&entity.client_id)
    .bind(entity.id)
    .bind(entity.version)
    .bind(entity.version)
    .bind(serde_json::to_string(&entity.payload)?)
    .bind(format_timestamp(&entity.updated_at))
    .bind(entity.deleted_at.as_ref().map(format_timestamp))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Drop server identity the server turned out not to know about
pub(crate) async fn forget_server_state_in(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    client_id: &str,
) -> ClientResult<()> {
    sqlx::query(
        "UPDATE local_entities SET server_id = NULL, server_version = 0 WHERE entity_type = ? AND client_id = ?",
    )
    .bind(entity_type.as_str())
    .bind(client_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Apply a local create, update or delete and enqueue the matching outbox entry.
///
/// Updates carry the patch and the speculative version they were made
/// against; the local row gets the merged payload and version + 1.
pub(crate) async fn apply_mutation(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    client_id: &str,
    operation: OperationType,
    payload: Value,
    now: DateTime<Utc>,
) -> ClientResult<LocalEntity> {
    JsonObjectValidator
        .validate(entity_type, operation, &payload)
        .map_err(ClientError::Invalid)?;

    let current = load(conn, entity_type, client_id).await?;
    let ts = format_timestamp(&now);

    let change = match (operation, current) {
        (OperationType::Create, Some(_)) => {
            return Err(ClientError::Invalid(format!(
                "{} {} already exists",
                entity_type, client_id
            )));
        }
        (OperationType::Create, None) => {
            sqlx::query(
                r#"
                INSERT INTO local_entities (entity_type, client_id, server_id, version,
                                            server_version, payload, updated_at, deleted_at)
                VALUES (?, ?, NULL, 1, 0, ?, ?, NULL)
                "#,
            )
            .bind(entity_type.as_str())
            .bind(client_id)
            .bind(serde_json::to_string(&payload)?)
            .bind(&ts)
            .execute(&mut *conn)
            .await?;

            NewChange {
                entity_type,
                client_id: client_id.to_string(),
                operation,
                base_version: None,
                payload,
                idempotency_key: Some(client_id.to_string()),
            }
        }
        (_, None) => {
            return Err(ClientError::NotFound(format!("{} {}", entity_type, client_id)));
        }
        (_, Some(local)) if local.is_deleted() => {
            return Err(ClientError::Invalid(format!(
                "{} {} is deleted",
                entity_type, client_id
            )));
        }
        (OperationType::Update, Some(local)) => {
            let merged = merge_payload(&local.payload, &payload);
            sqlx::query(
                r#"
                UPDATE local_entities SET version = version + 1, payload = ?, updated_at = ?
                WHERE entity_type = ? AND client_id = ?
                "#,
            )
            .bind(serde_json::to_string(&merged)?)
            .bind(&ts)
            .bind(entity_type.as_str())
            .bind(client_id)
            .execute(&mut *conn)
            .await?;

            NewChange {
                entity_type,
                client_id: client_id.to_string(),
                operation,
                base_version: Some(local.version),
                payload,
                idempotency_key: None,
            }
        }
        (OperationType::Delete, Some(local)) => {
            sqlx::query(
                r#"
                UPDATE local_entities SET version = version + 1, updated_at = ?, deleted_at = ?
                WHERE entity_type = ? AND client_id = ?
                "#,
            )
            .bind(&ts)
            .bind(&ts)
            .bind(entity_type.as_str())
            .bind(client_id)
            .execute(&mut *conn)
            .await?;

            NewChange {
                entity_type,
                client_id: client_id.to_string(),
                operation,
                base_version: Some(local.version),
                payload: Value::Null,
                idempotency_key: None,
            }
        }
    };

    outbox::enqueue_in(conn, &change, now).await?;

    load(conn, entity_type, client_id)
        .await?
        .ok_or_else(|| ClientError::Corrupt(format!("{} {} vanished", entity_type, client_id)))
}

const LOCAL_COLUMNS: &str = "l.entity_type, l.client_id, l.server_id, l.version, \
    l.server_version, l.payload, l.updated_at, l.deleted_at, \
    EXISTS (SELECT 1 FROM outbox o WHERE o.entity_type = l.entity_type AND o.client_id = l.client_id) AS dirty";

#[derive(sqlx::FromRow)]
struct LocalRow {
    entity_type: String,
    client_id: String,
    server_id: Option<i64>,
    version: i64,
    server_version: i64,
    payload: String,
    updated_at: String,
    deleted_at: Option<String>,
    dirty: i64,
}

impl LocalRow {
    fn into_entity(self) -> ClientResult<LocalEntity> {
        Ok(LocalEntity {
            entity_type: self.entity_type.parse().map_err(ClientError::Corrupt)?,
            client_id: self.client_id,
            server_id: self.server_id,
            version: self.version,
            server_version: self.server_version,
            payload: serde_json::from_str(&self.payload)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse_timestamp).transpose()?,
            dirty: self.dirty != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{open_local_in_memory, Outbox};
    use serde_json::json;

    fn server_row(client_id: &str, id: i64, version: i64, payload: Value) -> SyncableEntity {
        let now = Utc::now();
        SyncableEntity {
            entity_type: EntityType::Supplier,
            id,
            client_id: client_id.to_string(),
            version,
            payload,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_local_mutations_are_visible_and_queued() {
        let pool = open_local_in_memory().await.unwrap();
        let replica = ReplicaRepository::new(&pool);

        let created = replica
            .apply_local_mutation(
                EntityType::Supplier,
                "abc",
                OperationType::Create,
                json!({"name": "Acme", "region": "north"}),
            )
            .await
            .unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(created.server_id, None);
        assert!(created.dirty);

        let updated = replica
            .apply_local_mutation(
                EntityType::Supplier,
                "abc",
                OperationType::Update,
                json!({"name": "Acme Ltd"}),
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.payload, json!({"name": "Acme Ltd", "region": "north"}));

        let entries = Outbox::new(&pool).list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].idempotency_key.as_deref(), Some("abc"));
        assert_eq!(entries[1].base_version, Some(1));
        assert_eq!(entries[1].payload, json!({"name": "Acme Ltd"}));
    }

    #[tokio::test]
    async fn test_invalid_local_mutations_are_refused() {
        let pool = open_local_in_memory().await.unwrap();
        let replica = ReplicaRepository::new(&pool);

        let missing = replica
            .apply_local_mutation(EntityType::Rate, "nope", OperationType::Update, json!({}))
            .await;
        assert!(matches!(missing, Err(ClientError::NotFound(_))));

        let not_object = replica
            .apply_local_mutation(EntityType::Rate, "r1", OperationType::Create, json!([1, 2]))
            .await;
        assert!(matches!(not_object, Err(ClientError::Invalid(_))));

        replica
            .apply_local_mutation(EntityType::Rate, "r1", OperationType::Create, json!({"v": 1}))
            .await
            .unwrap();
        replica
            .apply_local_mutation(EntityType::Rate, "r1", OperationType::Delete, Value::Null)
            .await
            .unwrap();
        let again = replica
            .apply_local_mutation(EntityType::Rate, "r1", OperationType::Update, json!({"v": 2}))
            .await;
        assert!(matches!(again, Err(ClientError::Invalid(_))));
        assert_eq!(Outbox::new(&pool).list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_from_server_is_idempotent() {
        let pool = open_local_in_memory().await.unwrap();
        let replica = ReplicaRepository::new(&pool);
        let row = server_row("abc", 1, 1, json!({"name": "Acme"}));

        replica.upsert_from_server(&row).await.unwrap();
        let first = replica.get(EntityType::Supplier, 1).await.unwrap().unwrap();
        replica.upsert_from_server(&row).await.unwrap();
        let second = replica.get(EntityType::Supplier, 1).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.version, 1);
        assert!(!second.dirty);

        // Older rows never roll the replica back
        replica
            .upsert_from_server(&server_row("abc", 1, 3, json!({"name": "v3"})))
            .await
            .unwrap();
        replica.upsert_from_server(&row).await.unwrap();
        let current = replica.get_by_client_id(EntityType::Supplier, "abc").await.unwrap().unwrap();
        assert_eq!(current.version, 3);
        assert_eq!(current.payload, json!({"name": "v3"}));
    }

    #[tokio::test]
    async fn test_upsert_keeps_unsent_local_edits() {
        let pool = open_local_in_memory().await.unwrap();
        let replica = ReplicaRepository::new(&pool);
        replica
            .upsert_from_server(&server_row("abc", 1, 1, json!({"name": "Acme"})))
            .await
            .unwrap();
        replica
            .apply_local_mutation(
                EntityType::Supplier,
                "abc",
                OperationType::Update,
                json!({"name": "Mine"}),
            )
            .await
            .unwrap();

        replica
            .upsert_from_server(&server_row("abc", 1, 2, json!({"name": "Theirs"})))
            .await
            .unwrap();
        let local = replica.get_by_client_id(EntityType::Supplier, "abc").await.unwrap().unwrap();
        assert_eq!(local.payload, json!({"name": "Mine"}));
        assert_eq!(local.server_version, 2);
        assert!(local.dirty);

        replica
            .adopt_server_state(&server_row("abc", 1, 2, json!({"name": "Theirs"})))
            .await
            .unwrap();
        let local = replica.get_by_client_id(EntityType::Supplier, "abc").await.unwrap().unwrap();
        assert_eq!(local.payload, json!({"name": "Theirs"}));
        assert_eq!(local.version, 2);
    }

    #[tokio::test]
    async fn test_adopt_never_lowers_server_version() {
        let pool = open_local_in_memory().await.unwrap();
        let replica = ReplicaRepository::new(&pool);

        replica
            .adopt_server_state(&server_row("abc", 1, 3, json!({"name": "v3"})))
            .await
            .unwrap();
        replica
            .adopt_server_state(&server_row("abc", 1, 2, json!({"name": "v2"})))
            .await
            .unwrap();

        let local = replica.get_by_client_id(EntityType::Supplier, "abc").await.unwrap().unwrap();
        assert_eq!(local.server_version, 3);
        assert_eq!(local.version, 3);
        assert_eq!(local.payload, json!({"name": "v3"}));
    }

    #[tokio::test]
    async fn test_list_skips_tombstones() {
        let pool = open_local_in_memory().await.unwrap();
        let replica = ReplicaRepository::new(&pool);
        let mut gone = server_row("gone", 2, 2, json!({}));
        gone.deleted_at = Some(Utc::now());

        replica.upsert_from_server(&server_row("kept", 1, 1, json!({}))).await.unwrap();
        replica.upsert_from_server(&gone).await.unwrap();

        let live = replica.list(EntityType::Supplier).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].client_id, "kept");
    }
}
