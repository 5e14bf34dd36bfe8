use serde::{Deserialize, Serialize};

/// One stored upload, as recorded by the application's write path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadataEntry {
    /// Path relative to the uploads root, unique
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub md5_hash: String,
    pub category: String,
    pub uploader_id: Option<String>,
    /// Unix milliseconds of the last write
    pub uploaded_at: i64,
}

impl FileMetadataEntry {
    /// Validate that a stored path stays relative and inside the uploads tree
    pub fn validate_path(path: &str) -> bool {
        !path.is_empty()
            && !path.starts_with('/')
            && !path.contains('\\')
            && !path.contains('\0')
            && path.split('/').all(|part| !part.is_empty() && part != "." && part != "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(FileMetadataEntry::validate_path("docs/policy.pdf"));
        assert!(FileMetadataEntry::validate_path("avatar.png"));

        assert!(!FileMetadataEntry::validate_path(""));
        assert!(!FileMetadataEntry::validate_path("/etc/passwd"));
        assert!(!FileMetadataEntry::validate_path("docs/../../secret"));
        assert!(!FileMetadataEntry::validate_path("docs//x"));
        assert!(!FileMetadataEntry::validate_path("docs\\x"));
    }
}
