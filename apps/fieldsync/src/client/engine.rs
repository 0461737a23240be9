//! Sync client
//!
//! Drives a device's side of the protocol:
//! - local create/update/delete through the replica and outbox
//! - push: send outbox batches and settle each entry by its outcome
//! - pull: page through the server feed and upsert into the replica
//! - conflict resolution through the inbox
//!
//! A push whose response never arrives leaves its batch with an unknown
//! outcome. Those entries are retried as-is: creates are idempotency-keyed
//! and updates/deletes are version-guarded, so a repeat can only replay or
//! conflict. A conflict that shows the server already holding exactly what
//! the entry wrote settles it as applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use super::inbox::{ConflictInbox, StoredConflict};
use super::outbox::{ChangeLogEntry, Outbox};
use super::replica::{self, LocalEntity, ReplicaRepository};
use super::state::{self, SyncStateRepository};
use super::transport::SyncTransport;
use super::{ClientConfig, ClientError, ClientResult};
use crate::entities::{merge_payload, EntityType, SyncableEntity};
use crate::sync::{
    AppliedChange, ConflictedChange, EntryErrorKind, OperationType, PullRequest, PushRequest,
    PushResponse, RejectedChange, ResolutionStrategy,
};

/// What one `push` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSummary {
    pub batches: usize,
    pub sent: usize,
    pub applied: usize,
    /// Changes the server had already applied from an earlier send
    pub replayed: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Updates/deletes resent as creates
    pub rewritten: usize,
}

/// What one `pull` call did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSummary {
    pub pages: usize,
    pub rows: usize,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub push: PushSummary,
    pub pull: PullSummary,
}

/// User-facing sync counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub pending: i64,
    pub in_flight: i64,
    pub failed: i64,
    /// Failed entries that need user action
    pub exhausted: i64,
    pub conflicts: i64,
    pub cursor: Option<String>,
    pub last_pull_at: Option<DateTime<Utc>>,
}

/// Device-side sync driver
pub struct SyncClient<T: SyncTransport> {
    pool: SqlitePool,
    transport: T,
    device_id: String,
    config: ClientConfig,
}

impl<T: SyncTransport> SyncClient<T> {
    pub fn new(pool: SqlitePool, transport: T, device_id: &str, config: ClientConfig) -> Self {
        Self {
            pool,
            transport,
            device_id: device_id.to_string(),
            config,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Return entries interrupted by a crash to the retry queue.
    ///
    /// Call once at startup, before the first push.
    pub async fn recover(&self) -> ClientResult<u64> {
        let recovered = Outbox::new(&self.pool).recover_in_flight(Utc::now()).await?;
        if recovered > 0 {
            tracing::warn!(
                device_id = %self.device_id,
                recovered,
                "Recovered in-flight outbox entries"
            );
        }
        Ok(recovered)
    }

    /// Create an entity locally with a fresh client id
    pub async fn create(&self, entity_type: EntityType, payload: Value) -> ClientResult<LocalEntity> {
        let client_id = uuid::Uuid::new_v4().to_string();
        self.create_with_client_id(entity_type, &client_id, payload).await
    }

    pub async fn create_with_client_id(
        &self,
        entity_type: EntityType,
        client_id: &str,
        payload: Value,
    ) -> ClientResult<LocalEntity> {
        ReplicaRepository::new(&self.pool)
            .apply_local_mutation(entity_type, client_id, OperationType::Create, payload)
            .await
    }

    /// Merge `patch` into a local entity
    pub async fn update(
        &self,
        entity_type: EntityType,
        client_id: &str,
        patch: Value,
    ) -> ClientResult<LocalEntity> {
        ReplicaRepository::new(&self.pool)
            .apply_local_mutation(entity_type, client_id, OperationType::Update, patch)
            .await
    }

    pub async fn delete(&self, entity_type: EntityType, client_id: &str) -> ClientResult<LocalEntity> {
        ReplicaRepository::new(&self.pool)
            .apply_local_mutation(entity_type, client_id, OperationType::Delete, Value::Null)
            .await
    }

    pub async fn get(&self, entity_type: EntityType, client_id: &str) -> ClientResult<Option<LocalEntity>> {
        ReplicaRepository::new(&self.pool)
            .get_by_client_id(entity_type, client_id)
            .await
    }

    pub async fn list(&self, entity_type: EntityType) -> ClientResult<Vec<LocalEntity>> {
        ReplicaRepository::new(&self.pool).list(entity_type).await
    }

    /// Push the outbox until nothing is sendable
    pub async fn push(&self) -> ClientResult<PushSummary> {
        let outbox = Outbox::new(&self.pool);
        let replica = ReplicaRepository::new(&self.pool);
        let mut summary = PushSummary::default();

        loop {
            let batch = outbox
                .dequeue_batch(self.config.batch_size, Utc::now())
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut changes = Vec::with_capacity(batch.len());
            for entry in &batch {
                let server_id = replica
                    .get_by_client_id(entry.entity_type, &entry.client_id)
                    .await?
                    .and_then(|local| local.server_id);
                changes.push(entry.to_request(server_id));
            }

            let request = PushRequest {
                device_id: self.device_id.clone(),
                changes,
            };

            summary.batches += 1;
            summary.sent += batch.len();

            let response = match self.transport.push(&request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        device_id = %self.device_id,
                        entries = batch.len(),
                        "Push failed, batch outcome unknown: {}",
                        e
                    );
                    self.fail_batch(&batch, &e.to_string()).await?;
                    return Err(e);
                }
            };

            self.settle(&batch, response, &mut summary).await?;
        }

        tracing::info!(
            device_id = %self.device_id,
            sent = summary.sent,
            applied = summary.applied,
            conflicts = summary.conflicts,
            failed = summary.failed,
            "Push complete"
        );

        Ok(summary)
    }

    /// Pull every page after the stored cursor
    pub async fn pull(&self) -> ClientResult<PullSummary> {
        let state = SyncStateRepository::new(&self.pool);
        let mut summary = PullSummary::default();

        loop {
            let cursor = state.cursor().await?;
            let request = PullRequest {
                device_id: self.device_id.clone(),
                cursor: cursor.clone(),
                entity_types: None,
                limit: Some(self.config.pull_page_size),
            };

            let response = self.transport.pull(&request).await?;

            let mut tx = self.pool.begin().await?;
            for entity in response.entities.values().flatten() {
                replica::upsert_from_server_in(&mut tx, entity).await?;
            }
            state::save_cursor_in(&mut tx, &response.cursor, Utc::now()).await?;
            tx.commit().await?;

            summary.pages += 1;
            summary.rows += response.len();
            summary.cursor = Some(response.cursor.clone());

            tracing::debug!(
                device_id = %self.device_id,
                rows = response.len(),
                has_more = response.has_more,
                "Applied pull page"
            );

            if !response.has_more || cursor.as_deref() == Some(response.cursor.as_str()) {
                break;
            }
        }

        Ok(summary)
    }

    /// Push local changes, then pull remote ones
    pub async fn sync(&self) -> ClientResult<SyncReport> {
        let push = self.push().await?;
        let pull = self.pull().await?;
        Ok(SyncReport { push, pull })
    }

    pub async fn conflicts(&self) -> ClientResult<Vec<StoredConflict>> {
        ConflictInbox::new(&self.pool).list().await
    }

    pub async fn resolve_conflict(&self, id: i64, strategy: ResolutionStrategy) -> ClientResult<()> {
        ConflictInbox::new(&self.pool).resolve(id, strategy).await
    }

    /// Requeue failed entries, including ones that ran out of attempts
    pub async fn retry_failed(&self) -> ClientResult<u64> {
        Outbox::new(&self.pool).retry_failed().await
    }

    pub async fn status(&self) -> ClientResult<ClientStatus> {
        let counts = Outbox::new(&self.pool).counts().await?;
        let conflicts = ConflictInbox::new(&self.pool).count().await?;
        let state = SyncStateRepository::new(&self.pool);

        Ok(ClientStatus {
            pending: counts.pending,
            in_flight: counts.in_flight,
            failed: counts.failed,
            exhausted: counts.exhausted,
            conflicts,
            cursor: state.cursor().await?,
            last_pull_at: state.last_pull_at().await?,
        })
    }

    /// Apply each outcome of a push to the entry it answers, in batch order
    async fn settle(
        &self,
        batch: &[ChangeLogEntry],
        response: PushResponse,
        summary: &mut PushSummary,
    ) -> ClientResult<()> {
        let outbox = Outbox::new(&self.pool);
        let mut answered = vec![false; batch.len()];

        let mut settlements: Vec<Settlement> = response
            .success
            .into_iter()
            .map(Settlement::Applied)
            .chain(response.conflicts.into_iter().map(Settlement::Conflicted))
            .chain(response.errors.into_iter().map(Settlement::Rejected))
            .collect();
        settlements.sort_by_key(Settlement::index);

        for settlement in settlements {
            let index = settlement.index();
            let Some(entry) = batch.get(index) else {
                continue;
            };
            if std::mem::replace(&mut answered[index], true) {
                continue;
            }

            match settlement {
                Settlement::Applied(applied) => {
                    outbox.mark_synced(entry.id, &applied.entity).await?;
                    summary.applied += 1;
                    if applied.replayed {
                        summary.replayed += 1;
                    }
                }
                Settlement::Conflicted(conflicted) => {
                    let server = &conflicted.server_entity;
                    if entry.attempts > 1 && already_applied(entry, server) {
                        tracing::debug!(
                            device_id = %self.device_id,
                            entity_type = %entry.entity_type,
                            client_id = %entry.client_id,
                            version = server.version,
                            "Retried change was already applied"
                        );
                        outbox.mark_synced(entry.id, server).await?;
                        summary.applied += 1;
                        summary.replayed += 1;
                        continue;
                    }

                    let stored = outbox
                        .mark_conflicted(entry, &conflicted.conflict, server)
                        .await?;
                    summary.conflicts += stored.len();
                }
                Settlement::Rejected(rejected) => {
                    let error = rejected.error;

                    tracing::warn!(
                        device_id = %self.device_id,
                        entity_type = %entry.entity_type,
                        client_id = %entry.client_id,
                        kind = ?error.kind,
                        "Change rejected: {}",
                        error.message
                    );

                    if error.kind == EntryErrorKind::MissingTarget
                        && self.resend_as_create(entry).await?
                    {
                        summary.rewritten += 1;
                        continue;
                    }

                    let retry_at = if error.retryable {
                        self.retry_at(entry.attempts)
                    } else {
                        None
                    };
                    outbox.mark_failed(entry.id, &error.message, retry_at).await?;
                    summary.failed += 1;
                }
            }
        }

        let unanswered: Vec<ChangeLogEntry> = batch
            .iter()
            .zip(answered)
            .filter(|(_, answered)| !answered)
            .map(|(entry, _)| entry.clone())
            .collect();
        if !unanswered.is_empty() {
            self.fail_batch(&unanswered, "no outcome in push response").await?;
            summary.failed += unanswered.len();
        }

        Ok(())
    }

    /// Rewrite a lost-create entry as a create, unless an earlier entry for
    /// the same entity is still queued and may yet create it.
    async fn resend_as_create(&self, entry: &ChangeLogEntry) -> ClientResult<bool> {
        let outbox = Outbox::new(&self.pool);
        if outbox.has_earlier_entry(entry).await? {
            return Ok(false);
        }

        let local = ReplicaRepository::new(&self.pool)
            .get_by_client_id(entry.entity_type, &entry.client_id)
            .await?;
        let Some(local) = local else {
            return Err(ClientError::Corrupt(format!(
                "outbox entry {} has no local {} {}",
                entry.id, entry.entity_type, entry.client_id
            )));
        };

        outbox.rewrite_as_create(entry, &local.payload).await?;
        Ok(true)
    }

    async fn fail_batch(&self, entries: &[ChangeLogEntry], message: &str) -> ClientResult<()> {
        let outbox = Outbox::new(&self.pool);
        for entry in entries {
            outbox
                .mark_failed(entry.id, message, self.retry_at(entry.attempts))
                .await?;
        }
        Ok(())
    }

    /// Next retry time, or `None` once attempts are used up
    fn retry_at(&self, attempts: u32) -> Option<DateTime<Utc>> {
        if attempts >= self.config.max_attempts {
            return None;
        }
        let delay = chrono::Duration::from_std(self.config.backoff(attempts))
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Some(Utc::now() + delay)
    }
}

/// One outcome from a push response
enum Settlement {
    Applied(AppliedChange),
    Conflicted(ConflictedChange),
    Rejected(RejectedChange),
}

impl Settlement {
    fn index(&self) -> usize {
        match self {
            Settlement::Applied(c) => c.index,
            Settlement::Conflicted(c) => c.index,
            Settlement::Rejected(c) => c.index,
        }
    }
}

/// Whether the server row is exactly what this entry would have produced.
///
/// A resent update or delete whose first send was applied comes back as a
/// conflict one version past its base.
fn already_applied(entry: &ChangeLogEntry, server: &SyncableEntity) -> bool {
    let Some(base) = entry.base_version else {
        return false;
    };
    if server.version != base + 1 {
        return false;
    }

    match entry.operation {
        OperationType::Update => {
            !server.is_deleted() && merge_payload(&server.payload, &entry.payload) == server.payload
        }
        OperationType::Delete => server.is_deleted(),
        OperationType::Create => false,
    }
}
