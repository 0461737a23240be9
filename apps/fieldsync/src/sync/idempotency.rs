//! Idempotency guard for creates
//!
//! A create carries a client-supplied key that stays stable across retries.
//! The first create with a key reserves it and binds it to the new row; any
//! later create with the same key gets that row back untouched. Keys are
//! scoped per entity type. Updates and deletes are guarded by versions
//! instead and never pass through here.

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::entities::{format_timestamp, EntityRepository, EntityType, SyncableEntity};
use crate::error::{AppError, Result};

/// Result of checking an idempotency key
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// A previous create with this key succeeded
    Existing(SyncableEntity),
    /// The key is now held by the calling transaction
    Reserved,
}

pub struct IdempotencyGuard<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> IdempotencyGuard<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Look the key up, reserving it if unseen
    pub async fn check_or_reserve(
        &mut self,
        entity_type: EntityType,
        key: &str,
    ) -> Result<Reservation> {
        let existing: Option<(Option<i64>,)> = sqlx::query_as(
            "SELECT entity_id FROM idempotency_keys WHERE entity_type = ? AND idempotency_key = ?",
        )
        .bind(entity_type.as_str())
        .bind(key)
        .fetch_optional(&mut *self.conn)
        .await?;

        match existing {
            Some((Some(entity_id),)) => {
                let entity = EntityRepository::new(&mut *self.conn)
                    .get(entity_type, entity_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(format!(
                            "idempotency key {} points at missing {} {}",
                            key, entity_type, entity_id
                        ))
                    })?;
                Ok(Reservation::Existing(entity))
            }
            // Only visible if a reservation was committed without its row
            Some((None,)) => Err(AppError::Internal(format!(
                "idempotency key {} is reserved but unbound",
                key
            ))),
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO idempotency_keys (entity_type, idempotency_key, entity_id, created_at)
                    VALUES (?, ?, NULL, ?)
                    "#,
                )
                .bind(entity_type.as_str())
                .bind(key)
                .bind(format_timestamp(&Utc::now()))
                .execute(&mut *self.conn)
                .await?;

                Ok(Reservation::Reserved)
            }
        }
    }

    /// Bind a reserved key to the row it created
    pub async fn complete(&mut self, entity_type: EntityType, key: &str, entity_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE idempotency_keys SET entity_id = ? WHERE entity_type = ? AND idempotency_key = ?",
        )
        .bind(entity_id)
        .bind(entity_type.as_str())
        .bind(key)
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }
}
