//! Push and pull request handling
//!
//! `SyncService` holds no mutable state. Every request is an independent
//! unit of work; coordination between devices happens only through the
//! version column of the entity rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::SqlitePool;

use super::conflict::ConflictResolver;
use super::cursor::Cursor;
use super::feed::ChangeFeed;
use super::store::SyncLogRepository;
use super::types::{
    AppliedChange, ConflictedChange, DeviceSyncStatus, OperationType, Outcome, PullRequest,
    PullResponse, PushRequest, PushResponse, RejectedChange,
};
use super::validate::{JsonObjectValidator, PayloadValidator};
use crate::config::SyncSettings;
use crate::entities::EntityType;
use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct SyncService {
    pool: SqlitePool,
    settings: SyncSettings,
    validator: Arc<dyn PayloadValidator>,
}

impl SyncService {
    pub fn new(pool: SqlitePool, settings: SyncSettings) -> Self {
        Self::with_validator(pool, settings, Arc::new(JsonObjectValidator))
    }

    pub fn with_validator(
        pool: SqlitePool,
        settings: SyncSettings,
        validator: Arc<dyn PayloadValidator>,
    ) -> Self {
        Self {
            pool,
            settings,
            validator,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Apply a batch of changes, each on its own
    pub async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        let device_id = request.device_id.trim();
        if device_id.is_empty() {
            return Err(AppError::BadRequest("device_id is required".to_string()));
        }
        if request.changes.len() > self.settings.max_batch_size {
            return Err(AppError::PayloadTooLarge(format!(
                "batch of {} changes exceeds the limit of {}",
                request.changes.len(),
                self.settings.max_batch_size
            )));
        }

        let resolver = ConflictResolver::new(&self.pool, self.validator.as_ref());
        let log = SyncLogRepository::new(&self.pool);
        let mut response = PushResponse::default();

        for (index, change) in request.changes.into_iter().enumerate() {
            let outcome = resolver.apply(&change).await;

            if let Err(e) = log.record(device_id, &change, &outcome).await {
                tracing::error!(device_id, index, "Failed to record sync log entry: {}", e);
            }

            let change_id = change.change_id;
            match outcome {
                Outcome::Created { entity, replayed } => response.success.push(AppliedChange {
                    index,
                    change_id,
                    operation: OperationType::Create,
                    replayed,
                    entity,
                }),
                Outcome::Updated(entity) => response.success.push(AppliedChange {
                    index,
                    change_id,
                    operation: OperationType::Update,
                    replayed: false,
                    entity,
                }),
                Outcome::Deleted(entity) => response.success.push(AppliedChange {
                    index,
                    change_id,
                    operation: OperationType::Delete,
                    replayed: false,
                    entity,
                }),
                Outcome::Conflict { record, server } => {
                    response.conflicts.push(ConflictedChange {
                        index,
                        change_id,
                        conflict: record,
                        server_entity: server,
                    })
                }
                Outcome::Rejected(error) => response.errors.push(RejectedChange {
                    index,
                    change_id,
                    entity_type: change.entity_type,
                    entity_id: change.entity_id,
                    client_id: change.client_id,
                    error,
                }),
            }
        }

        tracing::info!(
            device_id,
            accepted = response.success.len(),
            conflicts = response.conflicts.len(),
            errors = response.errors.len(),
            "Processed push"
        );

        Ok(response)
    }

    /// Stream changes after the request's cursor
    pub async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        if request.device_id.trim().is_empty() {
            return Err(AppError::BadRequest("device_id is required".to_string()));
        }

        let cursor = match request.cursor.as_deref() {
            Some(token) if !token.trim().is_empty() => Cursor::decode(token)?,
            _ => Cursor::start(),
        };

        let mut entity_types = request
            .entity_types
            .unwrap_or_else(|| EntityType::ALL.to_vec());
        entity_types.sort();
        entity_types.dedup();

        let limit = request
            .limit
            .unwrap_or(self.settings.pull_page_size)
            .clamp(1, self.settings.pull_page_size.max(1));

        // One extra row tells us whether another page exists
        let mut items = ChangeFeed::new(&self.pool)
            .since(cursor, &entity_types, limit.saturating_add(1))
            .await?;
        let has_more = items.len() > limit;
        items.truncate(limit);

        let next_cursor = items
            .last()
            .map(|item| Cursor::at(item.change_seq))
            .unwrap_or(cursor);

        let mut entities: BTreeMap<EntityType, Vec<_>> = entity_types
            .iter()
            .map(|entity_type| (*entity_type, Vec::new()))
            .collect();
        for item in items {
            entities
                .entry(item.entity.entity_type)
                .or_default()
                .push(item.entity);
        }

        let response = PullResponse {
            entities,
            cursor: next_cursor.encode(),
            has_more,
        };

        tracing::debug!(
            device_id = %request.device_id,
            rows = response.len(),
            has_more,
            "Processed pull"
        );

        Ok(response)
    }

    pub async fn status(&self, device_id: &str) -> Result<DeviceSyncStatus> {
        SyncLogRepository::new(&self.pool).status(device_id).await
    }
}
