use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::constants::{
    ERR_INVALID_FILENAME, ERR_OUTSIDE_BACKUP_ROOT, LOG_ARCHIVE_SUFFIX, MAX_ARTIFACT_NAME_LEN,
    TAR_GZ_SUFFIX,
};
use crate::error::AppError;

// =============================================================================
// Checksums
// =============================================================================

/// SHA-256 of a byte slice (hex)
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of a file, streamed in 64 KiB chunks (hex)
///
/// Blocking; call from `spawn_blocking` when on the runtime.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// =============================================================================
// Artifact name validation (path traversal protection)
// =============================================================================

/// File name prefixes of every artifact this service writes
const ARTIFACT_PREFIXES: &[(&str, &str)] = &[
    ("db_full_", TAR_GZ_SUFFIX),
    ("db_inc_", TAR_GZ_SUFFIX),
    ("files_full_", TAR_GZ_SUFFIX),
    ("files_inc_", TAR_GZ_SUFFIX),
    ("logs_", LOG_ARCHIVE_SUFFIX),
];

/// Validate a client-supplied artifact file name
///
/// Only bare names produced by this service are accepted:
/// - a known prefix paired with its suffix
/// - ASCII letters, digits, `_`, `-` and `.` only
/// - no `..`, no path separators
/// - bounded length
///
/// The name is later looked up in the catalog and resolved under the backup
/// root, so this is the first of three gates.
pub fn validate_artifact_name(name: &str) -> Result<(), AppError> {
    let invalid = || AppError::InvalidInput(ERR_INVALID_FILENAME.to_string());

    if name.is_empty() || name.len() > MAX_ARTIFACT_NAME_LEN {
        return Err(invalid());
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        tracing::warn!("Rejected artifact name with path components: {:?}", name);
        return Err(invalid());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid());
    }

    let known = ARTIFACT_PREFIXES
        .iter()
        .any(|(prefix, suffix)| name.starts_with(prefix) && name.ends_with(suffix));
    if !known {
        return Err(invalid());
    }

    Ok(())
}

/// Resolve `relative` under `root` and make sure the real path stays inside it
///
/// Both sides are canonicalized, so symlinks pointing out of the backup tree
/// are rejected too. The target must exist.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, AppError> {
    let root = root.canonicalize()?;
    let candidate = root.join(relative);
    let resolved = match candidate.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(AppError::BackupNotFound),
        Err(e) => return Err(e.into()),
    };

    if !resolved.starts_with(&root) {
        tracing::warn!("Path {:?} resolved outside backup root", relative);
        return Err(AppError::Forbidden(ERR_OUTSIDE_BACKUP_ROOT.to_string()));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(&data));
    }

    #[test]
    fn test_validate_artifact_name_accepts_generated_names() {
        assert!(validate_artifact_name("db_full_20240101-020000-000.tar.gz").is_ok());
        assert!(validate_artifact_name("db_inc_20240101-030000-123.tar.gz").is_ok());
        assert!(validate_artifact_name("files_full_20240101-020000-000.tar.gz").is_ok());
        assert!(validate_artifact_name("files_inc_20240101-020000-000.tar.gz").is_ok());
        assert!(validate_artifact_name("logs_2024-01-01_1-500.json.gz").is_ok());
    }

    #[test]
    fn test_validate_artifact_name_rejects_traversal() {
        assert!(validate_artifact_name("").is_err());
        assert!(validate_artifact_name("../catalog.db").is_err());
        assert!(validate_artifact_name("db_full_..tar.gz").is_err());
        assert!(validate_artifact_name("db_full_/etc/passwd.tar.gz").is_err());
        assert!(validate_artifact_name("db_full_x\\y.tar.gz").is_err());
        assert!(validate_artifact_name("catalog.db").is_err());
        assert!(validate_artifact_name("logs_2024.tar.gz").is_err());
        assert!(validate_artifact_name("db_full_ x.tar.gz").is_err());
        assert!(validate_artifact_name(&format!("db_full_{}.tar.gz", "a".repeat(200))).is_err());
    }

    #[test]
    fn test_resolve_within_rejects_symlink_escape() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::fs::write(root.path().join("inside"), b"y").unwrap();

        assert!(resolve_within(root.path(), "inside").is_ok());
        assert!(matches!(
            resolve_within(root.path(), "missing"),
            Err(AppError::BackupNotFound)
        ));

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path().join("secret"), root.path().join("link"))
                .unwrap();
            assert!(matches!(
                resolve_within(root.path(), "link"),
                Err(AppError::Forbidden(_))
            ));
        }
    }
}
