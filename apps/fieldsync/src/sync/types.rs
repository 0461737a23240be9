//! Sync data types
//!
//! Defines the push/pull wire format and the per-change outcome model:
//! - Change requests (one outbox entry each)
//! - Explicit outcomes (created, updated, deleted, conflict, rejected)
//! - Conflict records surfaced to the client's inbox

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{EntityType, SyncableEntity};

/// Types of sync operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// A single change pushed by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Client correlation id, echoed back in the outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub entity_type: EntityType,
    pub operation: OperationType,
    /// Server id, when the client has learned it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Version the change was made against; absent for creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
    #[serde(default)]
    pub payload: Value,
    /// Required for creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<DateTime<Utc>>,
}

impl ChangeRequest {
    /// Human-readable reference for logs
    pub fn entity_ref(&self) -> String {
        match (self.entity_id, &self.client_id) {
            (Some(id), _) => id.to_string(),
            (None, Some(client_id)) => format!("client:{}", client_id),
            (None, None) => "unknown".to_string(),
        }
    }
}

/// Request to push changes to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    pub changes: Vec<ChangeRequest>,
}

/// Response from push operation, one bucket per outcome class
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: Vec<AppliedChange>,
    pub conflicts: Vec<ConflictedChange>,
    pub errors: Vec<RejectedChange>,
}

impl PushResponse {
    /// True when every change was accepted
    pub fn is_complete(&self) -> bool {
        self.conflicts.is_empty() && self.errors.is_empty()
    }
}

/// A change the server accepted (or recognised as an idempotent replay)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    /// Position in the pushed batch
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub operation: OperationType,
    /// Create matched an earlier create with the same idempotency key
    #[serde(default)]
    pub replayed: bool,
    pub entity: SyncableEntity,
}

/// A change that lost the optimistic version race
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictedChange {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub conflict: ConflictRecord,
    /// Full server state the client must adopt
    pub server_entity: SyncableEntity,
}

/// A change rejected without being applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedChange {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub error: EntryError,
}

/// Why a change conflicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Base version differs from the stored version
    VersionMismatch,
    /// The row is a tombstone
    DeletedOnServer,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::VersionMismatch => "version_mismatch",
            ConflictReason::DeletedOnServer => "deleted_on_server",
        }
    }
}

impl FromStr for ConflictReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "version_mismatch" => Ok(ConflictReason::VersionMismatch),
            "deleted_on_server" => Ok(ConflictReason::DeletedOnServer),
            other => Err(format!("unknown conflict reason: {}", other)),
        }
    }
}

/// How a user resolves a conflict from the inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Discard the client's write; the server state stays
    KeepServer,
    /// Re-enqueue the client's write against the current server version
    RetryClientWins,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::KeepServer => "keep_server",
            ResolutionStrategy::RetryClientWins => "retry_client_wins",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep_server" => Ok(ResolutionStrategy::KeepServer),
            "retry_client_wins" => Ok(ResolutionStrategy::RetryClientWins),
            other => Err(format!("unknown resolution strategy: {}", other)),
        }
    }
}

/// A conflict between a client's write and current server state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub client_id: String,
    pub operation: OperationType,
    pub reason: ConflictReason,
    pub server_version: i64,
    pub server_payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_base_version: Option<i64>,
    pub client_payload: Value,
    pub suggested_strategy: ResolutionStrategy,
}

/// Classes of per-entry rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryErrorKind {
    /// Update/delete for a row the server has never seen; resend as create
    MissingTarget,
    /// Payload or request shape failed validation
    Validation,
    /// Create reused a client id bound to a different idempotency key
    DuplicateClientId,
    /// Infrastructure failure while applying
    Transient,
}

/// Rejection of a single change; never affects its siblings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct EntryError {
    pub kind: EntryErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl EntryError {
    pub fn missing_target(entity_type: EntityType, entity_ref: &str) -> Self {
        Self {
            kind: EntryErrorKind::MissingTarget,
            message: format!("{} {} does not exist; resend as create", entity_type, entity_ref),
            retryable: true,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: EntryErrorKind::Validation,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn duplicate_client_id(entity_type: EntityType, client_id: &str) -> Self {
        Self {
            kind: EntryErrorKind::DuplicateClientId,
            message: format!("{} client_id {} is already in use", entity_type, client_id),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: EntryErrorKind::Transient,
            message: message.into(),
            retryable: true,
        }
    }
}

/// Result of reconciling one change against server state
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Created {
        entity: SyncableEntity,
        replayed: bool,
    },
    Updated(SyncableEntity),
    Deleted(SyncableEntity),
    Conflict {
        record: ConflictRecord,
        server: SyncableEntity,
    },
    Rejected(EntryError),
}

impl Outcome {
    /// Short label recorded in the sync log
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Created { replayed: false, .. } => "created",
            Outcome::Created { replayed: true, .. } => "replayed",
            Outcome::Updated(_) => "updated",
            Outcome::Deleted(_) => "deleted",
            Outcome::Conflict { .. } => "conflict",
            Outcome::Rejected(_) => "rejected",
        }
    }
}

/// Request to pull changes from server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequest {
    pub device_id: String,
    /// Opaque cursor from the previous pull; absent means from the beginning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_types: Option<Vec<EntityType>>,
    /// Page size, capped by server configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Response from pull operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changed rows per requested type, tombstones included
    pub entities: BTreeMap<EntityType, Vec<SyncableEntity>>,
    /// Cursor to persist and send on the next pull
    pub cursor: String,
    /// Whether there are more changes available
    pub has_more: bool,
}

impl PullResponse {
    pub fn len(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sync activity summary for one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSyncStatus {
    pub device_id: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub accepted: i64,
    pub conflicted: i64,
    pub rejected: i64,
}
