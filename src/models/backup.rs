use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::ERR_UNKNOWN_CLASS;
use crate::error::AppError;

/// What a backup protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupClass {
    Database,
    Files,
    Logs,
}

impl BackupClass {
    pub const ALL: [BackupClass; 3] = [BackupClass::Database, BackupClass::Files, BackupClass::Logs];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupClass::Database => "database",
            BackupClass::Files => "files",
            BackupClass::Logs => "logs",
        }
    }
}

impl fmt::Display for BackupClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupClass {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(BackupClass::Database),
            "files" => Ok(BackupClass::Files),
            "logs" => Ok(BackupClass::Logs),
            _ => Err(AppError::InvalidInput(ERR_UNKNOWN_CLASS.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupKind::Full),
            "incremental" => Ok(BackupKind::Incremental),
            other => Err(AppError::InvalidInput(format!("Unknown backup kind: {}", other))),
        }
    }
}

/// Outcome of the last verification of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Ok,
    Failed,
}

impl VerifyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyStatus::Ok => "ok",
            VerifyStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(VerifyStatus::Ok),
            "failed" => Some(VerifyStatus::Failed),
            _ => None,
        }
    }
}

/// Position in the store's write-ahead log captured by a database backup
///
/// `db_len` and `db_modified_ns` fingerprint the main store file. In WAL mode
/// only a checkpoint writes the main file, so a different fingerprint on the
/// next run means frames were folded in that the chain never captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalPosition {
    /// WAL header salts, `None` when the WAL was empty at capture time
    pub salt: Option<[u32; 2]>,
    /// End offset of the last committed frame captured
    pub offset: u64,
    pub db_len: u64,
    pub db_modified_ns: i64,
    /// False when the checkpoint before a full backup timed out or stayed busy
    pub checkpoint_clean: bool,
}

/// "Everything up to here is captured", stored on the record itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Watermark {
    Wal(WalPosition),
    Upload { uploaded_at: Option<i64> },
    Logs { covered_from: i64, covered_to: i64 },
}

/// One completed backup artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: i64,
    pub class: BackupClass,
    pub kind: BackupKind,
    pub file_name: String,
    /// Path relative to the backup root
    pub file_path: String,
    pub size_bytes: i64,
    /// Unix milliseconds
    pub created_at: i64,
    pub base_backup_id: Option<i64>,
    /// SHA-256 of the artifact file (hex)
    pub checksum: String,
    pub watermark: Option<Watermark>,
    /// Files, WAL frames bytes or log rows carried by the artifact
    pub item_count: i64,
    pub note: Option<String>,
    pub verify_status: Option<VerifyStatus>,
    pub verified_at: Option<i64>,
}

impl BackupRecord {
    pub fn wal_position(&self) -> Option<&WalPosition> {
        match &self.watermark {
            Some(Watermark::Wal(pos)) => Some(pos),
            _ => None,
        }
    }

    pub fn upload_watermark(&self) -> Option<i64> {
        match &self.watermark {
            Some(Watermark::Upload { uploaded_at }) => *uploaded_at,
            _ => None,
        }
    }

    pub fn failed_verification(&self) -> bool {
        self.verify_status == Some(VerifyStatus::Failed)
    }
}

/// Record about to be registered in the catalog
#[derive(Debug, Clone)]
pub struct NewBackupRecord {
    pub class: BackupClass,
    pub kind: BackupKind,
    pub file_name: String,
    pub file_path: String,
    pub size_bytes: i64,
    pub created_at: i64,
    pub base_backup_id: Option<i64>,
    pub checksum: String,
    pub watermark: Option<Watermark>,
    pub item_count: i64,
    pub note: Option<String>,
}

/// What an engine run produced
#[derive(Debug, Clone, Default)]
pub struct BackupRun {
    pub record: Option<BackupRecord>,
    /// Set when an incremental run had to take a full backup instead
    pub fallback: Option<String>,
    /// Reason when nothing needed capturing
    pub skipped: Option<String>,
    /// Per-item problems that did not fail the run
    pub warnings: Vec<String>,
}

impl BackupRun {
    pub fn completed(record: BackupRecord) -> Self {
        Self {
            record: Some(record),
            ..Default::default()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// Structured result of one backup run, success or not
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub class: BackupClass,
    pub requested: BackupKind,
    pub status: RunStatus,
    pub record: Option<BackupRecord>,
    pub fallback: Option<String>,
    pub warnings: Vec<String>,
    pub message: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl RunOutcome {
    pub fn from_run(class: BackupClass, requested: BackupKind, started_at: i64, run: BackupRun) -> Self {
        let status = if run.record.is_some() {
            RunStatus::Succeeded
        } else {
            RunStatus::Skipped
        };
        Self {
            class,
            requested,
            status,
            record: run.record,
            fallback: run.fallback,
            warnings: run.warnings,
            message: run.skipped,
            started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn failed(class: BackupClass, requested: BackupKind, started_at: i64, error: &AppError) -> Self {
        Self {
            class,
            requested,
            status: RunStatus::Failed,
            record: None,
            fallback: None,
            warnings: Vec::new(),
            message: Some(error.to_string()),
            started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindStats {
    pub count: i64,
    pub total_size_bytes: i64,
    pub latest_at: Option<i64>,
}

/// Per-kind counters of one backup class
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub full: KindStats,
    pub incremental: KindStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_round_trips_through_str() {
        for class in BackupClass::ALL {
            assert_eq!(class.as_str().parse::<BackupClass>().unwrap(), class);
        }
        assert!("uploads".parse::<BackupClass>().is_err());
    }

    #[test]
    fn test_watermark_json_shape() {
        let wm = Watermark::Wal(WalPosition {
            salt: Some([1, 2]),
            offset: 4152,
            db_len: 8192,
            db_modified_ns: 17,
            checkpoint_clean: true,
        });
        let json = serde_json::to_value(&wm).unwrap();
        assert_eq!(json["type"], "wal");
        assert_eq!(json["offset"], 4152);

        let back: Watermark = serde_json::from_value(json).unwrap();
        assert_eq!(back, wm);
    }

    #[test]
    fn test_outcome_status_follows_run() {
        let skipped = RunOutcome::from_run(
            BackupClass::Files,
            BackupKind::Incremental,
            0,
            BackupRun::skipped("nothing changed"),
        );
        assert_eq!(skipped.status, RunStatus::Skipped);
        assert_eq!(skipped.message.as_deref(), Some("nothing changed"));

        let failed = RunOutcome::failed(
            BackupClass::Database,
            BackupKind::Full,
            0,
            &AppError::WalNotEnabled("delete".to_string()),
        );
        assert!(failed.is_failed());
        assert!(failed.message.unwrap().contains("WAL not enabled"));
    }
}
