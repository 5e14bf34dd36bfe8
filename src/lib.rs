//! EHS Data Protection Library
//!
//! Backup, retention, verification and startup recovery for the primary
//! store, the upload tree and the audit log, plus the operator HTTP API.

pub mod archiver;
pub mod artifact;
pub mod audit_log;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod file_index;
pub mod models;
pub mod protection;
pub mod restore;
pub mod routes;
pub mod scheduler;
pub mod security;
pub mod verify;
pub mod wal;

pub use config::Config;
pub use error::{AppError, Result};
pub use protection::DataProtection;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub protection: Arc<DataProtection>,
    pub config: Config,
}

impl AppState {
    pub fn new(protection: Arc<DataProtection>, config: Config) -> Self {
        Self { protection, config }
    }
}

/// Routes of the operator API, without transport layers
pub fn create_router(state: AppState) -> Router {
    use routes::*;

    Router::new()
        .route("/health", get(health_check))
        .route("/api/data-protection/status", get(backup_status))
        .route(
            "/api/data-protection/backups",
            get(list_backups).post(manual_backup),
        )
        .route("/api/data-protection/backups/:class", post(trigger_backup))
        .route("/api/data-protection/records/:id", delete(delete_backup))
        .route("/api/data-protection/verify", post(verify_backup))
        .route("/api/data-protection/download", get(download_backup))
        .route("/api/data-protection/retention", post(retention_sweep))
        .route(
            "/api/data-protection/degraded/acknowledge",
            post(acknowledge_degraded),
        )
        .with_state(state)
}
