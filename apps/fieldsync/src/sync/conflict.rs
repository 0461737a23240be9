//! Conflict detection and resolution
//!
//! Applies one pushed change against the authoritative store. Version
//! equality is the only test for "no conflict"; timestamps never decide.
//! On a mismatch the server state wins and the client's write travels back
//! inside a [`ConflictRecord`] for the inbox.
//!
//! Each change runs in its own transaction touching one row, so a failure
//! on one change never rolls back its siblings.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use super::idempotency::{IdempotencyGuard, Reservation};
use super::types::{
    ChangeRequest, ConflictReason, ConflictRecord, EntryError, OperationType, Outcome,
    ResolutionStrategy,
};
use super::validate::PayloadValidator;
use crate::entities::{
    merge_payload, next_change_seq, EntityRepository, RowUpdate, SyncableEntity,
};
use crate::error::{AppError, Result};

/// Resolves pushed changes against server state
pub struct ConflictResolver<'a> {
    pool: &'a SqlitePool,
    validator: &'a dyn PayloadValidator,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(pool: &'a SqlitePool, validator: &'a dyn PayloadValidator) -> Self {
        Self { pool, validator }
    }

    /// Apply a change. Infrastructure failures become transient rejections.
    pub async fn apply(&self, change: &ChangeRequest) -> Outcome {
        match self.try_apply(change).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    entity_type = %change.entity_type,
                    entity = %change.entity_ref(),
                    operation = %change.operation,
                    error = %e,
                    "Failed to apply change"
                );
                Outcome::Rejected(EntryError::transient(e.to_string()))
            }
        }
    }

    async fn try_apply(&self, change: &ChangeRequest) -> Result<Outcome> {
        if let Err(rejection) = self.check_request(change) {
            return Ok(Outcome::Rejected(rejection));
        }

        match change.operation {
            OperationType::Create => self.create(change).await,
            OperationType::Update | OperationType::Delete => self.mutate(change).await,
        }
    }

    fn check_request(&self, change: &ChangeRequest) -> std::result::Result<(), EntryError> {
        match change.operation {
            OperationType::Create => {
                if non_empty(change.client_id.as_deref()).is_none() {
                    return Err(EntryError::validation("create requires client_id"));
                }
                if non_empty(change.idempotency_key.as_deref()).is_none() {
                    return Err(EntryError::validation("create requires idempotency_key"));
                }
            }
            OperationType::Update | OperationType::Delete => {
                if change.entity_id.is_none() && non_empty(change.client_id.as_deref()).is_none() {
                    return Err(EntryError::validation(format!(
                        "{} requires entity_id or client_id",
                        change.operation
                    )));
                }
                if change.base_version.is_none() {
                    return Err(EntryError::validation(format!(
                        "{} requires base_version",
                        change.operation
                    )));
                }
            }
        }

        self.validator
            .validate(change.entity_type, change.operation, &change.payload)
            .map_err(EntryError::validation)
    }

    async fn create(&self, change: &ChangeRequest) -> Result<Outcome> {
        let entity_type = change.entity_type;
        let (Some(client_id), Some(key)) = (
            non_empty(change.client_id.as_deref()),
            non_empty(change.idempotency_key.as_deref()),
        ) else {
            return Ok(Outcome::Rejected(EntryError::validation(
                "create requires client_id and idempotency_key",
            )));
        };

        let mut tx = self.pool.begin().await?;
        let seq = next_change_seq(&mut tx).await?;

        let reservation = IdempotencyGuard::new(&mut tx)
            .check_or_reserve(entity_type, key)
            .await?;
        if let Reservation::Existing(entity) = reservation {
            tx.rollback().await?;
            tracing::debug!(
                entity_type = %entity_type,
                entity_id = entity.id,
                idempotency_key = key,
                "Replayed create"
            );
            return Ok(Outcome::Created {
                entity,
                replayed: true,
            });
        }

        let taken = EntityRepository::new(&mut tx)
            .get_by_client_id(entity_type, client_id)
            .await?;
        if taken.is_some() {
            tx.rollback().await?;
            tracing::warn!(
                entity_type = %entity_type,
                client_id,
                idempotency_key = key,
                "Create reused a client id under a new idempotency key"
            );
            return Ok(Outcome::Rejected(EntryError::duplicate_client_id(
                entity_type,
                client_id,
            )));
        }

        let entity = EntityRepository::new(&mut tx)
            .insert(entity_type, client_id, &change.payload, seq, Utc::now())
            .await?;
        IdempotencyGuard::new(&mut tx)
            .complete(entity_type, key, entity.id)
            .await?;
        tx.commit().await?;

        tracing::debug!(entity_type = %entity_type, entity_id = entity.id, client_id, "Created entity");

        Ok(Outcome::Created {
            entity,
            replayed: false,
        })
    }

    async fn mutate(&self, change: &ChangeRequest) -> Result<Outcome> {
        let entity_type = change.entity_type;
        let Some(base_version) = change.base_version else {
            return Ok(Outcome::Rejected(EntryError::validation(format!(
                "{} requires base_version",
                change.operation
            ))));
        };

        let mut tx = self.pool.begin().await?;
        let seq = next_change_seq(&mut tx).await?;

        let target = load_target(&mut tx, change).await?;
        let Some(current) = target else {
            tx.rollback().await?;
            tracing::warn!(
                entity_type = %entity_type,
                entity = %change.entity_ref(),
                operation = %change.operation,
                "Change targets an entity the server has never seen"
            );
            return Ok(Outcome::Rejected(EntryError::missing_target(
                entity_type,
                &change.entity_ref(),
            )));
        };

        if current.is_deleted() {
            tx.rollback().await?;
            return Ok(conflict(change, current, ConflictReason::DeletedOnServer));
        }

        if base_version != current.version {
            tx.rollback().await?;
            return Ok(conflict(change, current, ConflictReason::VersionMismatch));
        }

        let updated_at = Utc::now().max(current.updated_at);
        let (payload, deleted_at) = match change.operation {
            OperationType::Delete => (current.payload.clone(), Some(updated_at)),
            _ => (merge_payload(&current.payload, &change.payload), None),
        };

        let swapped = EntityRepository::new(&mut tx)
            .compare_and_set(
                entity_type,
                current.id,
                base_version,
                &RowUpdate {
                    payload: &payload,
                    updated_at,
                    deleted_at,
                    change_seq: seq,
                },
            )
            .await?;

        if !swapped {
            let latest = EntityRepository::new(&mut tx)
                .get(entity_type, current.id)
                .await?;
            tx.rollback().await?;
            return Ok(match latest {
                Some(latest) => conflict(change, latest, ConflictReason::VersionMismatch),
                None => Outcome::Rejected(EntryError::missing_target(
                    entity_type,
                    &change.entity_ref(),
                )),
            });
        }

        let entity = EntityRepository::new(&mut tx)
            .get(entity_type, current.id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!("{} {} vanished mid-update", entity_type, current.id))
            })?;
        tx.commit().await?;

        tracing::debug!(
            entity_type = %entity_type,
            entity_id = entity.id,
            version = entity.version,
            operation = %change.operation,
            "Applied change"
        );

        Ok(match change.operation {
            OperationType::Delete => Outcome::Deleted(entity),
            _ => Outcome::Updated(entity),
        })
    }
}

/// Find the row a change targets, by server id first and client id second
async fn load_target(
    conn: &mut SqliteConnection,
    change: &ChangeRequest,
) -> Result<Option<SyncableEntity>> {
    let mut repo = EntityRepository::new(conn);
    let client_id = non_empty(change.client_id.as_deref());

    if let Some(id) = change.entity_id {
        let by_id = repo.get(change.entity_type, id).await?;
        // An id that belongs to another client's row is stale, not a match
        if let Some(entity) = by_id.filter(|e| client_id.map_or(true, |c| c == e.client_id)) {
            return Ok(Some(entity));
        }
    }

    match client_id {
        Some(client_id) => repo.get_by_client_id(change.entity_type, client_id).await,
        None => Ok(None),
    }
}

fn conflict(change: &ChangeRequest, server: SyncableEntity, reason: ConflictReason) -> Outcome {
    tracing::warn!(
        entity_type = %server.entity_type,
        entity_id = server.id,
        server_version = server.version,
        base_version = ?change.base_version,
        reason = reason.as_str(),
        "Conflict detected"
    );

    let record = ConflictRecord {
        entity_type: server.entity_type,
        entity_id: server.id,
        client_id: server.client_id.clone(),
        operation: change.operation,
        reason,
        server_version: server.version,
        server_payload: server.payload.clone(),
        client_base_version: change.base_version,
        client_payload: change.payload.clone(),
        suggested_strategy: ResolutionStrategy::KeepServer,
    };

    Outcome::Conflict { record, server }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;
    use crate::entities::EntityType;
    use crate::sync::validate::JsonObjectValidator;
    use crate::sync::EntryErrorKind;
    use serde_json::{json, Value};

    fn create_change(client_id: &str, payload: Value) -> ChangeRequest {
        ChangeRequest {
            change_id: None,
            entity_type: EntityType::Supplier,
            operation: OperationType::Create,
            entity_id: None,
            client_id: Some(client_id.to_string()),
            base_version: None,
            payload,
            idempotency_key: Some(client_id.to_string()),
            client_timestamp: Some(Utc::now()),
        }
    }

    fn update_change(entity_id: i64, base_version: i64, payload: Value) -> ChangeRequest {
        ChangeRequest {
            change_id: None,
            entity_type: EntityType::Supplier,
            operation: OperationType::Update,
            entity_id: Some(entity_id),
            client_id: None,
            base_version: Some(base_version),
            payload,
            idempotency_key: None,
            client_timestamp: Some(Utc::now()),
        }
    }

    fn delete_change(entity_id: i64, base_version: i64) -> ChangeRequest {
        ChangeRequest {
            operation: OperationType::Delete,
            payload: Value::Null,
            ..update_change(entity_id, base_version, Value::Null)
        }
    }

    fn created(outcome: Outcome) -> SyncableEntity {
        match outcome {
            Outcome::Created { entity, .. } => entity,
            other => panic!("expected Created, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_version_one() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);

        let entity = created(resolver.apply(&create_change("abc", json!({"name": "Acme"}))).await);

        assert_eq!(entity.id, 1);
        assert_eq!(entity.version, 1);
        assert_eq!(entity.client_id, "abc");
    }

    #[tokio::test]
    async fn test_retried_create_returns_same_entity() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);
        let change = create_change("abc", json!({"name": "Acme"}));

        let first = resolver.apply(&change).await;
        let second = resolver.apply(&change).await;

        let first = created(first);
        match second {
            Outcome::Created { entity, replayed } => {
                assert!(replayed);
                assert_eq!(entity, first);
            }
            other => panic!("expected replayed create, got {:?}", other),
        }

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM suppliers")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_update_increments_version_by_one() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);
        let entity = created(resolver.apply(&create_change("abc", json!({"name": "Acme", "phone": "1"}))).await);

        let outcome = resolver
            .apply(&update_change(entity.id, 1, json!({"phone": "2"})))
            .await;

        match outcome {
            Outcome::Updated(updated) => {
                assert_eq!(updated.version, 2);
                assert_eq!(updated.payload, json!({"name": "Acme", "phone": "2"}));
                assert!(updated.updated_at >= entity.updated_at);
            }
            other => panic!("expected Updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_base_version_conflicts() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);
        let entity = created(resolver.apply(&create_change("abc", json!({"name": "Acme"}))).await);
        resolver
            .apply(&update_change(entity.id, 1, json!({"name": "Acme 2"})))
            .await;

        let outcome = resolver
            .apply(&update_change(entity.id, 1, json!({"name": "Mine"})))
            .await;

        match outcome {
            Outcome::Conflict { record, server } => {
                assert_eq!(record.reason, ConflictReason::VersionMismatch);
                assert_eq!(record.server_version, 2);
                assert_eq!(record.client_base_version, Some(1));
                assert_eq!(record.client_payload, json!({"name": "Mine"}));
                assert_eq!(record.suggested_strategy, ResolutionStrategy::KeepServer);
                assert_eq!(server.payload["name"], "Acme 2");
            }
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_sets_tombstone_and_bumps_version() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);
        let entity = created(resolver.apply(&create_change("abc", json!({"name": "Acme"}))).await);

        match resolver.apply(&delete_change(entity.id, 1)).await {
            Outcome::Deleted(deleted) => {
                assert_eq!(deleted.version, 2);
                assert!(deleted.deleted_at.is_some());
                assert_eq!(deleted.payload, entity.payload);
            }
            other => panic!("expected Deleted, got {:?}", other),
        }

        // Tombstones are terminal
        match resolver
            .apply(&update_change(entity.id, 2, json!({"name": "again"})))
            .await
        {
            Outcome::Conflict { record, .. } => {
                assert_eq!(record.reason, ConflictReason::DeletedOnServer)
            }
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_of_unknown_entity_is_missing_target() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);

        let mut change = update_change(99, 1, json!({"name": "x"}));
        change.client_id = Some("never-created".to_string());

        match resolver.apply(&change).await {
            Outcome::Rejected(error) => {
                assert_eq!(error.kind, EntryErrorKind::MissingTarget);
                assert!(error.retryable);
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_resolves_client_id_when_server_id_unknown() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);
        created(resolver.apply(&create_change("abc", json!({"name": "Acme"}))).await);

        let mut change = update_change(0, 1, json!({"name": "Acme Ltd"}));
        change.entity_id = None;
        change.client_id = Some("abc".to_string());

        assert!(matches!(resolver.apply(&change).await, Outcome::Updated(e) if e.version == 2));
    }

    #[tokio::test]
    async fn test_create_requires_idempotency_key() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);

        let mut change = create_change("abc", json!({"name": "Acme"}));
        change.idempotency_key = None;

        match resolver.apply(&change).await {
            Outcome::Rejected(error) => assert_eq!(error.kind, EntryErrorKind::Validation),
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);

        let outcome = resolver.apply(&create_change("abc", json!("just a string"))).await;
        assert!(matches!(outcome, Outcome::Rejected(e) if e.kind == EntryErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_reused_client_id_with_new_key_is_rejected() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);
        created(resolver.apply(&create_change("abc", json!({"name": "Acme"}))).await);

        let mut change = create_change("abc", json!({"name": "Other"}));
        change.idempotency_key = Some("different-key".to_string());

        let outcome = resolver.apply(&change).await;
        assert!(
            matches!(outcome, Outcome::Rejected(e) if e.kind == EntryErrorKind::DuplicateClientId)
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_exactly_one_wins() {
        let pool = create_memory_pool().await.unwrap();
        let resolver = ConflictResolver::new(&pool, &JsonObjectValidator);
        let entity = created(resolver.apply(&create_change("abc", json!({"name": "Acme"}))).await);

        let a = update_change(entity.id, 1, json!({"name": "from A"}));
        let b = update_change(entity.id, 1, json!({"name": "from B"}));
        let (first, second) = tokio::join!(resolver.apply(&a), resolver.apply(&b));

        let outcomes = [first, second];
        let wins = outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Updated(_)))
            .count();
        let conflicts = outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Conflict { record, .. } if record.server_version == 2))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);
    }
}
