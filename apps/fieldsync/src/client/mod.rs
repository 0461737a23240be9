//! Device-side sync engine
//!
//! Everything a disconnected device needs to keep working locally and
//! reconcile later:
//! - `replica`: local copy of entities, written optimistically
//! - `outbox`: durable queue of local mutations awaiting push
//! - `inbox`: conflicts the server reported, waiting for the user
//! - `transport`: how pushes and pulls reach the server
//! - `engine`: `SyncClient`, which drives push, pull and resolution
//!
//! All state lives in a local SQLite database so nothing is lost across
//! restarts. Reads never touch the network.

mod engine;
mod inbox;
mod outbox;
mod replica;
mod schema;
mod state;
mod transport;

use std::time::Duration;

pub use engine::{ClientStatus, PullSummary, PushSummary, SyncClient, SyncReport};
pub use inbox::{ConflictInbox, StoredConflict};
pub use outbox::{ChangeLogEntry, EntryStatus, NewChange, Outbox, OutboxCounts};
pub use replica::{LocalEntity, ReplicaRepository};
pub use schema::{initialize_local_schema, open_local, open_local_in_memory};
pub use state::SyncStateRepository;
pub use transport::{HttpTransport, InProcessTransport, SyncTransport};

/// Client result type
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Errors raised by the device-side engine
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Local database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt local timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error("Corrupt local state: {0}")]
    Corrupt(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

/// Tuning for the device-side engine
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Most outbox entries sent in one push
    pub batch_size: usize,
    /// Attempts after which a failed entry stops being retried automatically
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Page size requested on pull
    pub pull_page_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            batch_size: 100,
            max_attempts: 8,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            pull_page_size: 500,
        }
    }
}

impl ClientConfig {
    /// Delay before the next try of an entry that has failed `attempts` times
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}
