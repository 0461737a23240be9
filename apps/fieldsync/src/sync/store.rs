//! Sync log persistence
//!
//! One row per change a device pushes, whatever the outcome. The log is for
//! auditing and status reporting; resolver correctness never reads it.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::types::{ChangeRequest, DeviceSyncStatus, Outcome};
use crate::entities::{format_timestamp, parse_timestamp};
use crate::error::Result;

/// Repository for the sync log
pub struct SyncLogRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SyncLogRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the outcome of one pushed change
    pub async fn record(
        &self,
        device_id: &str,
        change: &ChangeRequest,
        outcome: &Outcome,
    ) -> Result<()> {
        let (entity_ref, detail) = match outcome {
            Outcome::Created { entity, .. } | Outcome::Updated(entity) | Outcome::Deleted(entity) => {
                (entity.id.to_string(), Some(format!("version {}", entity.version)))
            }
            Outcome::Conflict { record, .. } => (
                record.entity_id.to_string(),
                Some(format!(
                    "{} (server {}, base {:?})",
                    record.reason.as_str(),
                    record.server_version,
                    record.client_base_version
                )),
            ),
            Outcome::Rejected(error) => (change.entity_ref(), Some(error.message.clone())),
        };

        sqlx::query(
            r#"
            INSERT INTO sync_log (device_id, entity_type, entity_ref, operation, outcome, detail, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(change.entity_type.as_str())
        .bind(&entity_ref)
        .bind(change.operation.as_str())
        .bind(outcome.label())
        .bind(&detail)
        .bind(format_timestamp(&Utc::now()))
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Summarise a device's sync history
    pub async fn status(&self, device_id: &str) -> Result<DeviceSyncStatus> {
        let row: SyncStatusRow = sqlx::query_as(
            r#"
            SELECT
                MAX(created_at) AS last_sync,
                COALESCE(SUM(CASE WHEN outcome IN ('created', 'replayed', 'updated', 'deleted') THEN 1 ELSE 0 END), 0) AS accepted,
                COALESCE(SUM(CASE WHEN outcome = 'conflict' THEN 1 ELSE 0 END), 0) AS conflicted,
                COALESCE(SUM(CASE WHEN outcome = 'rejected' THEN 1 ELSE 0 END), 0) AS rejected
            FROM sync_log
            WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_one(self.pool)
        .await?;

        let last_sync: Option<DateTime<Utc>> = row
            .last_sync
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;

        Ok(DeviceSyncStatus {
            device_id: device_id.to_string(),
            last_sync,
            accepted: row.accepted,
            conflicted: row.conflicted,
            rejected: row.rejected,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SyncStatusRow {
    last_sync: Option<String>,
    accepted: i64,
    conflicted: i64,
    rejected: i64,
}
