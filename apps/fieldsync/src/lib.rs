//! FieldSync
//!
//! Offline-first synchronization for field data collection: suppliers,
//! products, rates, collections and payments are edited on devices that are
//! often disconnected and reconciled against an authoritative server.
//!
//! # Modules
//!
//! - `entities`: Syncable record model and the authoritative entity store
//! - `sync`: Server-side push/pull, idempotency and conflict detection
//! - `client`: Device-side replica, outbox, conflict inbox and sync driver
//! - `routes`: HTTP surface for the sync protocol

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod client;
pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;

use state::AppState;

/// Build the HTTP application
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/health", get(routes::health::health_check))
        .nest("/api/v1/sync", routes::sync::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
