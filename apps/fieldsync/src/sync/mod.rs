//! Sync module for multi-device synchronization
//!
//! Provides:
//! - Idempotent creates keyed by a client-supplied token
//! - Optimistic version checks for updates and deletes
//! - Push/pull sync operations over an incremental change feed
//!
//! # Sync Protocol
//!
//! 1. Client sends `PushRequest` with a batch of outbox entries
//! 2. Server reconciles each entry on its own, in batch order
//! 3. Server answers with success, conflict and error buckets
//! 4. Client sends `PullRequest` with its cursor to get server changes
//! 5. Client upserts the rows and stores the returned cursor
//!
//! # Conflict Resolution
//!
//! - A write is accepted only if its base version equals the stored version
//! - Otherwise the server state wins and the client's write is returned in a
//!   `ConflictRecord` for manual resolution
//! - Tombstoned rows accept no further writes

mod conflict;
mod cursor;
mod feed;
mod idempotency;
mod service;
mod store;
mod types;
mod validate;

pub use conflict::ConflictResolver;
pub use cursor::{Cursor, CursorError};
pub use feed::{ChangeFeed, FeedItem};
pub use idempotency::{IdempotencyGuard, Reservation};
pub use service::SyncService;
pub use store::SyncLogRepository;
pub use types::{
    AppliedChange, ChangeRequest, ConflictReason, ConflictRecord, ConflictedChange,
    DeviceSyncStatus, EntryError, EntryErrorKind, OperationType, Outcome, PullRequest,
    PullResponse, PushRequest, PushResponse, RejectedChange, ResolutionStrategy,
};
pub use validate::{JsonObjectValidator, PayloadValidator};
