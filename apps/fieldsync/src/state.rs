//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::sync::SyncService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    sync: SyncService,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let sync = SyncService::new(db.clone(), config.sync);
        Self::with_sync(config, db, sync)
    }

    /// Build state around an already configured sync service
    pub fn with_sync(config: Config, db: SqlitePool, sync: SyncService) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, db, sync }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn sync(&self) -> &SyncService {
        &self.inner.sync
    }
}
