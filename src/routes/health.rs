use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// Health check endpoint
///
/// Reports store connectivity and whether the process runs on a degraded
/// recovery. A raised degraded flag keeps the status unhealthy until an
/// operator acknowledges it.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let connected = state.protection.store_connected().await;
    let degraded = state.protection.degraded();

    let status = if connected && degraded.is_none() {
        "healthy"
    } else if connected {
        "degraded"
    } else {
        "unhealthy"
    };

    Json(json!({
        "status": status,
        "database": if connected { "connected" } else { "disconnected" },
        "degraded": degraded,
        "environment": state.config.environment,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
