//! DatabaseBackupEngine: full and incremental copies of the primary store
//!
//! A full backup checkpoints, then copies the main file and the committed
//! WAL prefix. An incremental copies only the WAL bytes committed since the
//! previous record's watermark. Both copies happen while a read transaction
//! is open on the store, which keeps the WAL from being restarted underneath.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use super::now_ms;
use crate::artifact::{self, PartialFile, TarGzWriter, WrittenArtifact};
use crate::catalog::Catalog;
use crate::constants::{MANIFEST_ENTRY, STORE_ENTRY, STORE_WAL_ENTRY, WAL_SEGMENT_ENTRY};
use crate::db::{journal_mode, Store};
use crate::error::{AppError, Result};
use crate::models::{
    BackupClass, BackupKind, BackupRecord, BackupRun, BackupStats, NewBackupRecord, WalPosition,
    Watermark,
};
use crate::wal;

/// `manifest.json` of a database artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseManifest {
    pub kind: BackupKind,
    pub created_at: i64,
    /// Bytes of `store.db` (full only)
    pub store_bytes: u64,
    /// Bytes of `store.db-wal` (full) or `wal.segment` (incremental)
    pub wal_bytes: u64,
    pub base_backup_id: Option<i64>,
    pub previous_backup_id: Option<i64>,
    /// WAL range `[from_offset, to_offset)` carried by the artifact
    pub from_offset: u64,
    pub to_offset: u64,
    pub salt: Option<[u32; 2]>,
    pub page_size: Option<u32>,
    /// SHA-256 of the WAL bytes carried (hex), absent when there are none
    pub wal_sha256: Option<String>,
    pub checkpoint_clean: bool,
}

/// Length and modification time of the main store file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified_ns: i64,
}

fn fingerprint(path: &Path) -> io::Result<Fingerprint> {
    let meta = fs::metadata(path)?;
    let modified_ns = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok(Fingerprint {
        len: meta.len(),
        modified_ns,
    })
}

/// Path of the WAL file that belongs to a store file
pub fn wal_path(database_path: &Path) -> PathBuf {
    let mut name = database_path.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}

/// SHA-256 of bytes `[from, to)` of a file (hex)
fn sha256_range(path: &Path, from: u64, to: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let mut hasher = Sha256::new();
    let mut limited = file.take(to.saturating_sub(from));
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = limited.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

enum IncrementalCapture {
    Written(WrittenArtifact, WalPosition, u64),
    NothingNew,
    ChainBroken(String),
}

#[derive(Clone)]
pub struct DatabaseBackupEngine {
    store: Store,
    database_path: PathBuf,
    backup_root: PathBuf,
    catalog: Catalog,
    checkpoint_timeout: Duration,
}

impl DatabaseBackupEngine {
    pub fn new(
        store: Store,
        database_path: PathBuf,
        backup_root: PathBuf,
        catalog: Catalog,
        checkpoint_timeout: Duration,
    ) -> Self {
        Self {
            store,
            database_path,
            backup_root,
            catalog,
            checkpoint_timeout,
        }
    }

    /// Fail fast unless the store runs in WAL mode
    pub async fn ensure_wal(&self) -> Result<()> {
        let mode = journal_mode(&self.store).await?;
        if mode != "wal" {
            tracing::error!("Database backup refused: journal mode is {}", mode);
            return Err(AppError::WalNotEnabled(mode));
        }
        Ok(())
    }

    /// Checkpoint with a deadline; `false` when it timed out or stayed busy
    async fn checkpoint(&self) -> Result<bool> {
        let outcome = tokio::time::timeout(
            self.checkpoint_timeout,
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").fetch_one(&self.store),
        )
        .await;

        match outcome {
            Ok(Ok(row)) => {
                let busy: i64 = row.try_get(0)?;
                if busy != 0 {
                    tracing::warn!("WAL checkpoint could not complete (busy), continuing");
                }
                Ok(busy == 0)
            }
            Ok(Err(sqlx::Error::Database(e))) if e.message().contains("locked") => {
                tracing::warn!("WAL checkpoint blocked: {}, continuing", e.message());
                Ok(false)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!(
                    "WAL checkpoint timed out after {:?}, continuing without it",
                    self.checkpoint_timeout
                );
                Ok(false)
            }
        }
    }

    pub async fn run_full_backup(&self) -> Result<BackupRun> {
        self.ensure_wal().await?;
        let checkpoint_clean = self.checkpoint().await?;

        let mut snapshot = self.store.begin().await?;
        sqlx::query("SELECT count(*) FROM sqlite_master")
            .fetch_one(&mut *snapshot)
            .await?;

        let (created_at, file_name) = artifact::unique_tar_artifact(
            &self.backup_root,
            BackupClass::Database,
            BackupKind::Full,
            now_ms(),
        );
        let database_path = self.database_path.clone();
        let backup_root = self.backup_root.clone();
        let name = file_name.clone();

        let written = tokio::task::spawn_blocking(move || {
            write_full_artifact(&backup_root, &database_path, &name, created_at, checkpoint_clean)
        })
        .await;
        snapshot.rollback().await?;
        let (written, position) = written??;

        let note = (!checkpoint_clean)
            .then(|| "WAL checkpoint incomplete; WAL prefix included in artifact".to_string());
        let new = NewBackupRecord {
            class: BackupClass::Database,
            kind: BackupKind::Full,
            file_name: written.file_name.clone(),
            file_path: written.rel_path.clone(),
            size_bytes: written.size_bytes,
            created_at,
            base_backup_id: None,
            checksum: written.checksum.clone(),
            watermark: Some(Watermark::Wal(position.clone())),
            item_count: position.offset as i64,
            note,
        };
        let record = self.register(&written, &new).await?;

        tracing::info!(
            "Database full backup {} written ({} bytes, checkpoint clean: {})",
            record.file_name,
            record.size_bytes,
            checkpoint_clean
        );
        Ok(BackupRun::completed(record))
    }

    pub async fn run_incremental_backup(&self) -> Result<BackupRun> {
        self.ensure_wal().await?;

        let Some((full, chain)) = self.catalog.latest_chain(BackupClass::Database).await? else {
            return self
                .fall_back_to_full("no full database backup to base an incremental on")
                .await;
        };
        if !self.backup_root.join(&full.file_path).is_file() {
            return self
                .fall_back_to_full(&format!("base artifact {} is missing", full.file_name))
                .await;
        }
        let previous: &BackupRecord = chain.last().unwrap_or(&full);
        let Some(prev_pos) = previous.wal_position().cloned() else {
            return self
                .fall_back_to_full(&format!("{} carries no WAL watermark", previous.file_name))
                .await;
        };

        let mut snapshot = self.store.begin().await?;
        sqlx::query("SELECT count(*) FROM sqlite_master")
            .fetch_one(&mut *snapshot)
            .await?;

        let (created_at, file_name) = artifact::unique_tar_artifact(
            &self.backup_root,
            BackupClass::Database,
            BackupKind::Incremental,
            now_ms(),
        );
        let database_path = self.database_path.clone();
        let backup_root = self.backup_root.clone();
        let (base_id, previous_id) = (full.id, previous.id);

        let capture = tokio::task::spawn_blocking(move || {
            capture_incremental(
                &backup_root,
                &database_path,
                &file_name,
                created_at,
                &prev_pos,
                base_id,
                previous_id,
            )
        })
        .await;
        snapshot.rollback().await?;

        match capture?? {
            IncrementalCapture::NothingNew => {
                tracing::info!("Database incremental skipped: no new WAL frames");
                Ok(BackupRun::skipped("no new committed WAL frames since the last backup"))
            }
            IncrementalCapture::ChainBroken(reason) => self.fall_back_to_full(&reason).await,
            IncrementalCapture::Written(written, position, bytes) => {
                let new = NewBackupRecord {
                    class: BackupClass::Database,
                    kind: BackupKind::Incremental,
                    file_name: written.file_name.clone(),
                    file_path: written.rel_path.clone(),
                    size_bytes: written.size_bytes,
                    created_at,
                    base_backup_id: Some(base_id),
                    checksum: written.checksum.clone(),
                    watermark: Some(Watermark::Wal(position)),
                    item_count: bytes as i64,
                    note: None,
                };
                let record = self.register(&written, &new).await?;
                tracing::info!(
                    "Database incremental backup {} written ({} WAL bytes, base {})",
                    record.file_name,
                    bytes,
                    base_id
                );
                Ok(BackupRun::completed(record))
            }
        }
    }

    pub async fn stats(&self) -> Result<BackupStats> {
        self.catalog.stats(BackupClass::Database).await
    }

    async fn fall_back_to_full(&self, reason: &str) -> Result<BackupRun> {
        tracing::warn!("Database incremental falling back to full backup: {}", reason);
        let mut run = self.run_full_backup().await?;
        run.fallback = Some(reason.to_string());
        Ok(run)
    }

    async fn register(&self, written: &WrittenArtifact, new: &NewBackupRecord) -> Result<BackupRecord> {
        match self.catalog.insert_record(new).await {
            Ok(record) => Ok(record),
            Err(e) => {
                written.discard();
                Err(e)
            }
        }
    }
}

fn write_full_artifact(
    backup_root: &Path,
    database_path: &Path,
    file_name: &str,
    created_at: i64,
    checkpoint_clean: bool,
) -> Result<(WrittenArtifact, WalPosition)> {
    let print = fingerprint(database_path)?;
    let wal_file = wal_path(database_path);
    let scan = wal::scan_file(&wal_file)?;
    let wal_sha256 = if scan.committed_end > 0 {
        Some(sha256_range(&wal_file, 0, scan.committed_end)?)
    } else {
        None
    };

    let manifest = DatabaseManifest {
        kind: BackupKind::Full,
        created_at,
        store_bytes: print.len,
        wal_bytes: scan.committed_end,
        base_backup_id: None,
        previous_backup_id: None,
        from_offset: 0,
        to_offset: scan.committed_end,
        salt: scan.salt(),
        page_size: scan.header.map(|h| h.page_size),
        wal_sha256,
        checkpoint_clean,
    };

    let rel_dir = artifact::relative_dir(BackupClass::Database, BackupKind::Full);
    let (partial, file) = PartialFile::create(backup_root, rel_dir, file_name)?;
    let mut tar = TarGzWriter::new(file);
    tar.append_bytes(MANIFEST_ENTRY, &serde_json::to_vec_pretty(&manifest)?)?;
    tar.append_file_prefix(STORE_ENTRY, database_path, print.len)?;
    if scan.committed_end > 0 {
        tar.append_file_prefix(STORE_WAL_ENTRY, &wal_file, scan.committed_end)?;
    }
    let written = partial.commit(tar.finish()?)?;

    let position = WalPosition {
        salt: scan.salt(),
        offset: scan.committed_end,
        db_len: print.len,
        db_modified_ns: print.modified_ns,
        checkpoint_clean,
    };
    Ok((written, position))
}

fn capture_incremental(
    backup_root: &Path,
    database_path: &Path,
    file_name: &str,
    created_at: i64,
    previous: &WalPosition,
    base_backup_id: i64,
    previous_backup_id: i64,
) -> Result<IncrementalCapture> {
    let print = fingerprint(database_path)?;
    if print.len != previous.db_len || print.modified_ns != previous.db_modified_ns {
        return Ok(IncrementalCapture::ChainBroken(
            "store file changed since the last backup (checkpoint outside the backup chain)"
                .to_string(),
        ));
    }

    let wal_file = wal_path(database_path);
    let scan = wal::scan_file(&wal_file)?;
    if let Some(salt) = previous.salt {
        if scan.salt() != Some(salt) {
            return Ok(IncrementalCapture::ChainBroken(
                "WAL was restarted since the last backup".to_string(),
            ));
        }
    } else if previous.offset != 0 {
        return Ok(IncrementalCapture::ChainBroken(
            "previous watermark has an offset but no WAL salt".to_string(),
        ));
    }
    if scan.committed_end < previous.offset {
        return Ok(IncrementalCapture::ChainBroken(
            "WAL is shorter than the last captured offset".to_string(),
        ));
    }
    if scan.committed_end == previous.offset {
        return Ok(IncrementalCapture::NothingNew);
    }

    let from = previous.offset;
    let to = scan.committed_end;
    let manifest = DatabaseManifest {
        kind: BackupKind::Incremental,
        created_at,
        store_bytes: 0,
        wal_bytes: to - from,
        base_backup_id: Some(base_backup_id),
        previous_backup_id: Some(previous_backup_id),
        from_offset: from,
        to_offset: to,
        salt: scan.salt(),
        page_size: scan.header.map(|h| h.page_size),
        wal_sha256: Some(sha256_range(&wal_file, from, to)?),
        checkpoint_clean: previous.checkpoint_clean,
    };

    let rel_dir = artifact::relative_dir(BackupClass::Database, BackupKind::Incremental);
    let (partial, file) = PartialFile::create(backup_root, rel_dir, file_name)?;
    let mut tar = TarGzWriter::new(file);
    tar.append_bytes(MANIFEST_ENTRY, &serde_json::to_vec_pretty(&manifest)?)?;
    tar.append_file_range(WAL_SEGMENT_ENTRY, &wal_file, from, to)?;
    let written = partial.commit(tar.finish()?)?;

    let position = WalPosition {
        salt: scan.salt(),
        offset: to,
        db_len: print.len,
        db_modified_ns: print.modified_ns,
        checkpoint_clean: previous.checkpoint_clean,
    };
    Ok(IncrementalCapture::Written(written, position, to - from))
}

/// Read and parse `manifest.json` of a database artifact
pub fn read_manifest(artifact_path: &Path) -> Result<DatabaseManifest> {
    let bytes = artifact::read_entry(artifact_path, MANIFEST_ENTRY)?.ok_or_else(|| {
        AppError::IntegrityFailure(format!("{} has no manifest", artifact_path.display()))
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}
