use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::AppError;
use crate::models::BackupClass;
use crate::security::validate_artifact_name;

/// Convert unix milliseconds to an RFC3339 string, defaulting to now if invalid
pub fn timestamp_to_rfc3339(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Backup class from a path segment
pub fn parse_class(raw: &str) -> Result<BackupClass, AppError> {
    raw.parse()
}

/// `?filename=` / `{"filename": ...}` carrying an artifact name
#[derive(Debug, Deserialize)]
pub struct FilenameParams {
    pub filename: String,
}

impl FilenameParams {
    /// The artifact name, rejected early when it cannot be one
    pub fn artifact_name(&self) -> Result<&str, AppError> {
        let name = self.filename.trim();
        validate_artifact_name(name)?;
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_to_rfc3339() {
        assert_eq!(timestamp_to_rfc3339(0), "1970-01-01T00:00:00+00:00");
        assert_eq!(
            timestamp_to_rfc3339(1_700_000_000_123),
            "2023-11-14T22:13:20.123+00:00"
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_parse_class() {
        assert_eq!(parse_class("files").unwrap(), BackupClass::Files);
        assert!(matches!(parse_class("everything"), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn test_filename_params_reject_traversal() {
        let params = FilenameParams {
            filename: "../../etc/passwd".to_string(),
        };
        assert!(params.artifact_name().is_err());

        let params = FilenameParams {
            filename: "db_full_20240101-000000-000.tar.gz".to_string(),
        };
        assert_eq!(params.artifact_name().unwrap(), "db_full_20240101-000000-000.tar.gz");
    }
}
