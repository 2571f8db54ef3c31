//! # ridesafe-backend
//!
//! Dispatch backend for RideSafe SOS alerts.
//!
//! - HTTP API (axum): alert intake, status changes, responder accept, rider heartbeats
//! - Push channel (socketioxide): one private room per device
//! - Datastore: Postgres via sqlx, or in-memory when no database is configured
//!
//! `build_app` wires all three together. `api_router` gives the HTTP routes
//! alone for in-process tests.

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod persistence;
pub mod push;
pub mod state;
pub mod validation;

use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;
use socketioxide::SocketIo;
use tower_http::cors::{Any, CorsLayer};

use audit::AuditLogger;
use config::BackendConfig;
use persistence::Datastore;
use push::SocketNotifier;
use state::AppState;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn api_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/v1/alerts", post(handlers::create_alert))
        .route("/api/v1/alerts/:id/status", patch(handlers::update_status))
        .route("/api/v1/alerts/:id/accept", post(handlers::accept_alert))
        .route("/api/v1/riders/heartbeat", post(handlers::rider_heartbeat))
        .route("/sync", get(handlers::time_sync))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(cors)
}

/// HTTP routes plus the Socket.IO layer, with pushes going to connected devices.
pub fn build_app(config: &BackendConfig, store: Datastore) -> (Router, SocketIo) {
    let (socket_layer, io) = SocketIo::builder().build_layer();
    push::register_namespace(&io);

    let notifier = Arc::new(SocketNotifier::new(io.clone()));
    let audit = AuditLogger::new(config.audit_log_path.clone());
    let state = AppState::new(store, notifier, audit, config);

    (api_router(state).layer(socket_layer), io)
}
