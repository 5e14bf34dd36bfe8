//! Integration tests for the data protection HTTP API
//!
//! These tests drive the router end to end against a real store, catalog and
//! backup tree inside a temporary directory.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use ehs_data_protection::artifact;
use ehs_data_protection::catalog::Catalog;
use ehs_data_protection::db::{create_store_pool, init_store_schema, store_options, Store};
use ehs_data_protection::models::{BackupClass, BackupKind, NewAuditLogEntry};
use ehs_data_protection::restore::{raise_degraded, RecoveryOutcome};
use ehs_data_protection::{create_router, AppState, Config, DataProtection};

// =============================================================================
// Test Helpers
// =============================================================================

/// Create a test configuration rooted in `dir`
fn test_config(dir: &Path) -> Config {
    Config {
        server_host: "127.0.0.1".to_string(),
        server_port: 0, // Random port
        environment: "test".to_string(),
        allowed_origins: vec!["http://localhost:5173".to_string()],
        database_path: dir.join("data/app.db"),
        uploads_dir: dir.join("uploads"),
        backup_root: dir.join("backups"),
        file_index_dir: dir.join("file-index"),
        core_export_dir: dir.join("core_data"),
        db_full_interval: Duration::from_secs(24 * 3600),
        db_incremental_interval: Duration::from_secs(3600),
        files_full_interval: Duration::from_secs(24 * 3600),
        files_incremental_interval: Duration::from_secs(3600),
        log_archive_interval: Duration::from_secs(15 * 24 * 3600),
        log_live_retention_days: 90,
        log_archive_retention_days: 3650,
        retention_max_age_days: 30,
        retention_min_keep: 3,
        checkpoint_timeout: Duration::from_secs(5),
        scheduler_tick: Duration::from_secs(60),
        scheduler_enabled: false,
    }
}

/// Build the orchestrator the way `main` does, minus the recovery check
async fn create_protection(config: &Config) -> (Arc<DataProtection>, Store) {
    artifact::ensure_layout(&config.backup_root).unwrap();
    std::fs::create_dir_all(config.database_path.parent().unwrap()).unwrap();
    std::fs::create_dir_all(&config.uploads_dir).unwrap();

    let catalog = Catalog::open(&config.backup_root).await.unwrap();
    let store = create_store_pool(store_options(&config.database_path));
    init_store_schema(&store).await.unwrap();

    let protection = DataProtection::new(config, store.clone(), catalog, RecoveryOutcome::Healthy);
    (Arc::new(protection), store)
}

/// Create a test app router
async fn create_test_app(temp_dir: &TempDir) -> (Router, Arc<DataProtection>, Store) {
    let config = test_config(temp_dir.path());
    let (protection, store) = create_protection(&config).await;
    let state = AppState::new(protection.clone(), config);
    (create_router(state), protection, store)
}

async fn insert_department(store: &Store, id: &str) {
    sqlx::query("INSERT INTO departments (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(format!("Department {}", id))
        .execute(store)
        .await
        .unwrap();
}

/// Parse response body as JSON
async fn body_to_json(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Body) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    (status, response.into_body())
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    (status, body_to_json(response.into_body()).await)
}

async fn post_empty(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    (status, body_to_json(response.into_body()).await)
}

// =============================================================================
// Health Check Tests
// =============================================================================

#[tokio::test]
async fn test_health_check() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, _) = create_test_app(&temp_dir).await;

    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);

    let json = body_to_json(body).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "connected");
    assert!(json["degraded"].is_null());
}

#[tokio::test]
async fn test_health_reports_degraded_until_acknowledged() {
    let temp_dir = TempDir::new().unwrap();
    let (app, protection, _) = create_test_app(&temp_dir).await;

    let outcome = RecoveryOutcome::Degraded {
        reason: "store file missing or empty; no database backup available".to_string(),
        departments: 2,
        users: 5,
    };
    raise_degraded(protection.backup_root(), &outcome).unwrap();

    let (_, body) = get(&app, "/health").await;
    let json = body_to_json(body).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["degraded"]["outcome"]["outcome"], "degraded");

    let (status, json) = post_empty(&app, "/api/data-protection/degraded/acknowledge").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cleared"], true);

    let (_, body) = get(&app, "/health").await;
    assert_eq!(body_to_json(body).await["status"], "healthy");

    // Second acknowledgement has nothing to clear
    let (_, json) = post_empty(&app, "/api/data-protection/degraded/acknowledge").await;
    assert_eq!(json["cleared"], false);
}

// =============================================================================
// Trigger / List / Status Tests
// =============================================================================

#[tokio::test]
async fn test_list_is_empty_before_any_backup() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, _) = create_test_app(&temp_dir).await;

    let (status, body) = get(&app, "/api/data-protection/backups").await;
    assert_eq!(status, StatusCode::OK);

    let json = body_to_json(body).await;
    assert_eq!(json["total"], 0);
    assert_eq!(json["backups"], json!([]));
}

#[tokio::test]
async fn test_trigger_database_backup() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, store) = create_test_app(&temp_dir).await;
    insert_department(&store, "d1").await;

    let (status, json) = post_empty(&app, "/api/data-protection/backups/database").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "succeeded");
    assert_eq!(json["class"], "database");
    assert_eq!(json["record"]["kind"], "full");
    assert!(json["record"]["fileName"]
        .as_str()
        .unwrap()
        .starts_with("db_full_"));

    let (_, body) = get(&app, "/api/data-protection/backups").await;
    let list = body_to_json(body).await;
    assert_eq!(list["total"], 1);
    assert_eq!(list["backups"][0]["class"], "database");
    assert!(list["backups"][0]["createdAtIso"].is_string());
    assert!(list["backups"][0]["sizeHuman"].is_string());
}

#[tokio::test]
async fn test_trigger_unknown_class_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, _) = create_test_app(&temp_dir).await;

    let (status, json) = post_empty(&app, "/api/data-protection/backups/everything").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Unknown backup class"));
}

#[tokio::test]
async fn test_trigger_logs_with_nothing_to_archive_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let (app, protection, _) = create_test_app(&temp_dir).await;
    protection
        .audit_log()
        .append(&NewAuditLogEntry::new("login", "auth", chrono::Utc::now().timestamp_millis()))
        .await
        .unwrap();

    let (status, json) = post_empty(&app, "/api/data-protection/backups/logs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "skipped");
    assert!(json["record"].is_null());
}

#[tokio::test]
async fn test_manual_backup_runs_database_and_files() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, _) = create_test_app(&temp_dir).await;

    let (status, json) = post_empty(&app, "/api/data-protection/backups").await;
    assert_eq!(status, StatusCode::OK);

    let outcomes = json.as_array().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0]["class"], "database");
    assert_eq!(outcomes[1]["class"], "files");
    assert!(outcomes.iter().all(|o| o["status"] == "succeeded"));
}

#[tokio::test]
async fn test_status_reports_every_class() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, _) = create_test_app(&temp_dir).await;
    post_empty(&app, "/api/data-protection/backups/database").await;

    let (status, body) = get(&app, "/api/data-protection/status").await;
    assert_eq!(status, StatusCode::OK);

    let json = body_to_json(body).await;
    assert_eq!(json["healthy"], true);
    let classes = json["classes"].as_array().unwrap();
    assert_eq!(classes.len(), 3);
    assert_eq!(classes[0]["class"], "database");
    assert_eq!(classes[0]["inProgress"], false);
    assert_eq!(classes[0]["stats"]["full"]["count"], 1);
    assert!(classes[0]["lastFull"]["fileName"].is_string());
    assert!(classes[1]["lastFull"].is_null());
    assert_eq!(json["failedVerifications"], json!([]));

    let jobs = json["jobs"].as_array().unwrap();
    assert!(jobs.iter().any(|j| j["job"] == "database_full" && j["lastError"].is_null()));
}

// =============================================================================
// Verify Tests
// =============================================================================

#[tokio::test]
async fn test_verify_database_backup() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, store) = create_test_app(&temp_dir).await;
    insert_department(&store, "d1").await;
    insert_department(&store, "d2").await;

    let (_, outcome) = post_empty(&app, "/api/data-protection/backups/database").await;
    let filename = outcome["record"]["fileName"].as_str().unwrap().to_string();

    let (status, report) = post_json(
        &app,
        "/api/data-protection/verify",
        json!({ "filename": filename }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["ok"], true);
    assert_eq!(report["checksumOk"], true);
    assert_eq!(report["archiveOk"], true);
    assert_eq!(report["smokeTest"]["departments"], 2);
}

#[tokio::test]
async fn test_verify_reports_tampered_artifact_without_deleting_it() {
    let temp_dir = TempDir::new().unwrap();
    let (app, protection, _) = create_test_app(&temp_dir).await;

    let (_, outcome) = post_empty(&app, "/api/data-protection/backups/files").await;
    let filename = outcome["record"]["fileName"].as_str().unwrap().to_string();
    let rel_path = outcome["record"]["filePath"].as_str().unwrap().to_string();
    let artifact_path = protection.backup_root().join(&rel_path);

    let mut bytes = std::fs::read(&artifact_path).unwrap();
    bytes.push(0);
    std::fs::write(&artifact_path, bytes).unwrap();

    let (status, report) = post_json(
        &app,
        "/api/data-protection/verify",
        json!({ "filename": filename }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["ok"], false);
    assert_eq!(report["checksumOk"], false);
    assert!(artifact_path.exists());

    let (_, body) = get(&app, "/api/data-protection/status").await;
    let status = body_to_json(body).await;
    assert_eq!(status["healthy"], false);
    assert_eq!(status["failedVerifications"][0]["fileName"], filename);
}

#[tokio::test]
async fn test_verify_rejects_path_traversal() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, _) = create_test_app(&temp_dir).await;

    let (status, _) = post_json(
        &app,
        "/api/data-protection/verify",
        json!({ "filename": "../catalog.db" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// Download Tests
// =============================================================================

#[tokio::test]
async fn test_download_streams_artifact() {
    let temp_dir = TempDir::new().unwrap();
    let (app, protection, _) = create_test_app(&temp_dir).await;

    let (_, outcome) = post_empty(&app, "/api/data-protection/backups/database").await;
    let filename = outcome["record"]["fileName"].as_str().unwrap().to_string();
    let rel_path = outcome["record"]["filePath"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/data-protection/download?filename={}", filename))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .contains(&filename));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let on_disk = std::fs::read(protection.backup_root().join(rel_path)).unwrap();
    assert_eq!(bytes.as_ref(), on_disk.as_slice());
}

#[tokio::test]
async fn test_download_rejects_path_traversal() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, _) = create_test_app(&temp_dir).await;

    for name in [
        "../catalog.db",
        "..%2Fcatalog.db",
        "db_full_..%2F..%2Fetc%2Fpasswd.tar.gz",
        "catalog.db",
        "%2Fetc%2Fpasswd",
    ] {
        let (status, _) = get(&app, &format!("/api/data-protection/download?filename={}", name)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "accepted {}", name);
    }
}

#[tokio::test]
async fn test_download_unknown_artifact() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, _) = create_test_app(&temp_dir).await;

    let (status, _) = get(
        &app,
        "/api/data-protection/download?filename=db_full_20240101-000000-000.tar.gz",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Deletion Tests
// =============================================================================

#[tokio::test]
async fn test_delete_full_with_incrementals_is_refused() {
    let temp_dir = TempDir::new().unwrap();
    let (app, protection, store) = create_test_app(&temp_dir).await;
    insert_department(&store, "d1").await;

    let full = protection
        .run(BackupClass::Database, BackupKind::Full)
        .await
        .unwrap();
    let full_id = full.record.unwrap().id;

    insert_department(&store, "d2").await;
    let inc = protection
        .run(BackupClass::Database, BackupKind::Incremental)
        .await
        .unwrap();
    let inc = inc.record.unwrap();
    assert_eq!(inc.kind, BackupKind::Incremental);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/data-protection/records/{}", full_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Dependents first, then the base
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/data-protection/records/{}", inc.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!protection.backup_root().join(&inc.file_path).exists());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/data-protection/records/{}", full_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_retention_endpoint_keeps_recent_backups() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _, _) = create_test_app(&temp_dir).await;
    post_empty(&app, "/api/data-protection/backups/database").await;

    let (status, json) = post_empty(&app, "/api/data-protection/retention").await;
    assert_eq!(status, StatusCode::OK);

    let reports = json.as_array().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0]["class"], "database");
    assert_eq!(reports[0]["deleted"], json!([]));
    assert_eq!(reports[0]["kept"], 1);
}
