use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::backup::RetentionReport;
use crate::error::Result;
use crate::models::{BackupRecord, RunOutcome};
use crate::protection::ProtectionStatus;
use crate::routes::validation::{format_bytes, parse_class, timestamp_to_rfc3339, FilenameParams};
use crate::verify::VerifyReport;
use crate::AppState;

/// One catalog entry as shown to operators
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupListItem {
    #[serde(flatten)]
    pub record: BackupRecord,
    pub created_at_iso: String,
    pub size_human: String,
}

impl From<BackupRecord> for BackupListItem {
    fn from(record: BackupRecord) -> Self {
        Self {
            created_at_iso: timestamp_to_rfc3339(record.created_at),
            size_human: format_bytes(record.size_bytes.max(0) as u64),
            record,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BackupListResponse {
    pub total: usize,
    pub backups: Vec<BackupListItem>,
}

#[derive(Debug, Serialize)]
pub struct AcknowledgeResponse {
    pub success: bool,
    pub cleared: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteBackupResponse {
    pub success: bool,
    pub deleted: BackupRecord,
}

fn outcome_status(outcome: &RunOutcome) -> StatusCode {
    if outcome.is_failed() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

/// GET /api/data-protection/status
pub async fn backup_status(State(state): State<AppState>) -> Result<Json<ProtectionStatus>> {
    Ok(Json(state.protection.status().await?))
}

/// GET /api/data-protection/backups
pub async fn list_backups(State(state): State<AppState>) -> Result<Json<BackupListResponse>> {
    let backups: Vec<BackupListItem> = state
        .protection
        .list()
        .await?
        .into_iter()
        .map(BackupListItem::from)
        .collect();

    Ok(Json(BackupListResponse {
        total: backups.len(),
        backups,
    }))
}

/// POST /api/data-protection/backups/:class
///
/// Manual full backup of one class. Answers 409 while a run of that class
/// is in progress and 500 with the run outcome when the run failed.
pub async fn trigger_backup(
    State(state): State<AppState>,
    Path(class): Path<String>,
) -> Result<(StatusCode, Json<RunOutcome>)> {
    let class = parse_class(&class)?;
    tracing::info!("Manual {} backup requested", class);

    let outcome = state.protection.trigger(class).await?;
    Ok((outcome_status(&outcome), Json(outcome)))
}

/// POST /api/data-protection/backups
///
/// Full database and files backups.
pub async fn manual_backup(State(state): State<AppState>) -> (StatusCode, Json<Vec<RunOutcome>>) {
    tracing::info!("Manual database and files backup requested");
    let outcomes = state.protection.manual_backup().await;

    let status = if outcomes.iter().any(RunOutcome::is_failed) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(outcomes))
}

/// POST /api/data-protection/verify
pub async fn verify_backup(
    State(state): State<AppState>,
    Json(params): Json<FilenameParams>,
) -> Result<Json<VerifyReport>> {
    let filename = params.artifact_name()?;
    Ok(Json(state.protection.verify(filename).await?))
}

/// DELETE /api/data-protection/records/:id
///
/// Refused with 409 for a full backup that incrementals still depend on.
pub async fn delete_backup(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteBackupResponse>> {
    let deleted = state.protection.delete_backup(id).await?;
    Ok(Json(DeleteBackupResponse {
        success: true,
        deleted,
    }))
}

/// POST /api/data-protection/retention
pub async fn retention_sweep(State(state): State<AppState>) -> Result<Json<Vec<RetentionReport>>> {
    Ok(Json(state.protection.retention_sweep().await?))
}

/// POST /api/data-protection/degraded/acknowledge
pub async fn acknowledge_degraded(State(state): State<AppState>) -> Result<Json<AcknowledgeResponse>> {
    let cleared = state.protection.acknowledge_degraded()?;
    Ok(Json(AcknowledgeResponse {
        success: true,
        cleared,
    }))
}
