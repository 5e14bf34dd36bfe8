use serde::{Deserialize, Serialize};

/// Row of the append-only audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: i64,
    /// Unix milliseconds
    pub created_at: i64,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub action: String,
    pub module: String,
    pub target_id: Option<String>,
    pub details: Option<String>,
}

/// Audit event about to be appended
#[derive(Debug, Clone)]
pub struct NewAuditLogEntry {
    pub created_at: i64,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub action: String,
    pub module: String,
    pub target_id: Option<String>,
    pub details: Option<String>,
}

impl NewAuditLogEntry {
    pub fn new(action: impl Into<String>, module: impl Into<String>, created_at: i64) -> Self {
        Self {
            created_at,
            user_id: None,
            user_name: None,
            action: action.into(),
            module: module.into(),
            target_id: None,
            details: None,
        }
    }
}

/// Durable description of one log archive, written before any live row is removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveManifest {
    pub record_id: i64,
    pub archive_file: String,
    /// Unix milliseconds, inclusive
    pub covered_from: i64,
    /// Unix milliseconds, inclusive
    pub covered_to: i64,
    pub first_log_id: i64,
    pub last_log_id: i64,
    pub row_count: i64,
    /// SHA-256 of the archive file (hex)
    pub checksum: String,
    pub created_at: i64,
}
