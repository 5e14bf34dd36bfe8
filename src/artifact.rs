//! Backup-root layout and the artifact write protocol
//!
//! Every artifact is written as `<name>.partial` next to its final location,
//! fsynced, hashed and renamed. Only then is a catalog record inserted, so a
//! crash leaves either nothing or an unregistered `.partial` that startup
//! cleanup removes.

use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::constants::{
    ARTIFACT_TIMESTAMP_FORMAT, CATALOG_FILE_NAME, LOG_ARCHIVE_SUFFIX, PARTIAL_SUFFIX,
    TAR_GZ_SUFFIX,
};
use crate::models::{BackupClass, BackupKind};
use crate::security::sha256_file;

/// Directory of an artifact class/kind, relative to the backup root
pub fn relative_dir(class: BackupClass, kind: BackupKind) -> &'static str {
    match (class, kind) {
        (BackupClass::Database, BackupKind::Full) => "database/full",
        (BackupClass::Database, BackupKind::Incremental) => "database/incremental",
        (BackupClass::Files, BackupKind::Full) => "files/full",
        (BackupClass::Files, BackupKind::Incremental) => "files/incremental",
        (BackupClass::Logs, _) => "logs/archives",
    }
}

fn prefix(class: BackupClass, kind: BackupKind) -> &'static str {
    match (class, kind) {
        (BackupClass::Database, BackupKind::Full) => "db_full_",
        (BackupClass::Database, BackupKind::Incremental) => "db_inc_",
        (BackupClass::Files, BackupKind::Full) => "files_full_",
        (BackupClass::Files, BackupKind::Incremental) => "files_inc_",
        (BackupClass::Logs, _) => "logs_",
    }
}

/// File name of a database or files artifact taken at `created_at` (unix ms)
pub fn tar_artifact_name(class: BackupClass, kind: BackupKind, created_at: i64) -> String {
    let ts = Utc
        .timestamp_millis_opt(created_at)
        .single()
        .unwrap_or_else(Utc::now);
    format!(
        "{}{}{}",
        prefix(class, kind),
        ts.format(ARTIFACT_TIMESTAMP_FORMAT),
        TAR_GZ_SUFFIX
    )
}

/// Pick a creation time whose artifact name is still free under `backup_root`
///
/// Names carry millisecond precision; two runs inside the same millisecond
/// get consecutive timestamps.
pub fn unique_tar_artifact(
    backup_root: &Path,
    class: BackupClass,
    kind: BackupKind,
    mut created_at: i64,
) -> (i64, String) {
    let dir = backup_root.join(relative_dir(class, kind));
    loop {
        let name = tar_artifact_name(class, kind, created_at);
        let taken = dir.join(&name).exists()
            || dir.join(format!("{}{}", name, PARTIAL_SUFFIX)).exists();
        if !taken {
            return (created_at, name);
        }
        created_at += 1;
    }
}

/// File name of a log archive covering one UTC day
pub fn log_archive_name(day: &str, first_log_id: i64, last_log_id: i64) -> String {
    format!(
        "{}{}_{}-{}{}",
        prefix(BackupClass::Logs, BackupKind::Full),
        day,
        first_log_id,
        last_log_id,
        LOG_ARCHIVE_SUFFIX
    )
}

/// Path of the backup catalog database
pub fn catalog_path(backup_root: &Path) -> PathBuf {
    backup_root.join(CATALOG_FILE_NAME)
}

/// Create every artifact directory under the backup root
pub fn ensure_layout(backup_root: &Path) -> io::Result<()> {
    for class in BackupClass::ALL {
        for kind in [BackupKind::Full, BackupKind::Incremental] {
            fs::create_dir_all(backup_root.join(relative_dir(class, kind)))?;
        }
    }
    Ok(())
}

/// An artifact that reached its final name
#[derive(Debug, Clone)]
pub struct WrittenArtifact {
    pub file_name: String,
    /// Relative to the backup root, `/`-separated
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size_bytes: i64,
    pub checksum: String,
}

impl WrittenArtifact {
    /// Remove the artifact again, used when registering it in the catalog fails
    pub fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.abs_path) {
            tracing::warn!("Failed to remove unregistered artifact {:?}: {}", self.abs_path, e);
        }
    }
}

/// A `.partial` file that is removed on drop unless committed
pub struct PartialFile {
    partial_path: PathBuf,
    final_path: PathBuf,
    rel_path: String,
    file_name: String,
    committed: bool,
}

impl PartialFile {
    pub fn create(backup_root: &Path, rel_dir: &str, file_name: &str) -> io::Result<(Self, File)> {
        let dir = backup_root.join(rel_dir);
        fs::create_dir_all(&dir)?;

        let final_path = dir.join(file_name);
        if final_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("artifact {} already exists", file_name),
            ));
        }
        let partial_path = dir.join(format!("{}{}", file_name, PARTIAL_SUFFIX));
        let file = File::create(&partial_path)?;

        Ok((
            Self {
                partial_path,
                final_path,
                rel_path: format!("{}/{}", rel_dir, file_name),
                file_name: file_name.to_string(),
                committed: false,
            },
            file,
        ))
    }

    /// Flush and fsync `file`, hash it, and move it to its final name
    pub fn commit(mut self, file: File) -> io::Result<WrittenArtifact> {
        file.sync_all()?;
        drop(file);

        let size_bytes = fs::metadata(&self.partial_path)?.len() as i64;
        let checksum = sha256_file(&self.partial_path)?;
        fs::rename(&self.partial_path, &self.final_path)?;
        sync_parent(&self.final_path);
        self.committed = true;

        Ok(WrittenArtifact {
            file_name: self.file_name.clone(),
            rel_path: self.rel_path.clone(),
            abs_path: self.final_path.clone(),
            size_bytes,
            checksum,
        })
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed && self.partial_path.exists() {
            if let Err(e) = fs::remove_file(&self.partial_path) {
                tracing::warn!("Failed to remove partial artifact {:?}: {}", self.partial_path, e);
            }
        }
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

/// Remove every `*.partial` left under the backup root by an interrupted run
pub fn cleanup_partials(backup_root: &Path) -> io::Result<usize> {
    fn walk(dir: &Path, removed: &mut usize) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                walk(&path, removed)?;
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
            {
                tracing::warn!("Removing leftover partial artifact {:?}", path);
                fs::remove_file(&path)?;
                *removed += 1;
            }
        }
        Ok(())
    }

    if !backup_root.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    walk(backup_root, &mut removed)?;
    Ok(removed)
}

// =============================================================================
// tar.gz helpers
// =============================================================================

/// tar stream compressed with gzip, written into an open file
pub struct TarGzWriter {
    builder: tar::Builder<GzEncoder<File>>,
}

impl TarGzWriter {
    pub fn new(file: File) -> Self {
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(false);
        Self { builder }
    }

    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        self.builder.append_data(&mut header, name, data)
    }

    pub fn append_file(&mut self, name: &str, path: &Path) -> io::Result<()> {
        let mut file = File::open(path)?;
        self.builder.append_file(name, &mut file)
    }

    /// Append the first `len` bytes of `path`
    pub fn append_file_prefix(&mut self, name: &str, path: &Path, len: u64) -> io::Result<()> {
        self.append_file_range(name, path, 0, len)
    }

    /// Append bytes `[from, to)` of `path`
    pub fn append_file_range(&mut self, name: &str, path: &Path, from: u64, to: u64) -> io::Result<()> {
        let mut file = File::open(path)?;
        io::Seek::seek(&mut file, io::SeekFrom::Start(from))?;
        let len = to.saturating_sub(from);

        let mut header = tar::Header::new_gnu();
        header.set_size(len);
        header.set_mode(0o644);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        self.builder.append_data(&mut header, name, file.take(len))
    }

    /// Finish the tar stream and the gzip member, returning the file for fsync
    pub fn finish(self) -> io::Result<File> {
        let encoder = self.builder.into_inner()?;
        let mut file = encoder.finish()?;
        file.flush()?;
        Ok(file)
    }
}

pub fn open_tar_gz(path: &Path) -> io::Result<tar::Archive<GzDecoder<File>>> {
    Ok(tar::Archive::new(GzDecoder::new(File::open(path)?)))
}

/// Read one entry of a tar.gz fully into memory
pub fn read_entry(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    let mut archive = open_tar_gz(path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(name) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

/// Copy one entry of a tar.gz to `dest`, returning the number of bytes written
pub fn extract_entry(path: &Path, name: &str, dest: &Path) -> io::Result<Option<u64>> {
    let mut archive = open_tar_gz(path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(name) {
            let mut out = File::create(dest)?;
            let n = io::copy(&mut entry, &mut out)?;
            out.sync_all()?;
            return Ok(Some(n));
        }
    }
    Ok(None)
}
