//! Database chain restore and the startup recovery guard
//!
//! A chain is staged in a scratch directory next to the store: `store.db`
//! from the full, then a WAL assembled from the full's WAL prefix and every
//! incremental segment in order. SQLite recovers that WAL on open; the
//! result is checkpointed, checked, and only then moved into place.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::artifact;
use crate::backup::database::{read_manifest, wal_path};
use crate::catalog::Catalog;
use crate::constants::{DEGRADED_MARKER_FILE, STORE_ENTRY, STORE_WAL_ENTRY, WAL_SEGMENT_ENTRY};
use crate::db::{self, tables, SmokeReport};
use crate::error::{AppError, Result};
use crate::models::{BackupClass, BackupKind, BackupRecord, CoreUser, Department};
use crate::security::sha256_file;

/// Result of the startup integrity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Store present and usable
    Healthy,
    /// No store and no database backup ever taken: first start
    Fresh,
    /// Rebuilt from a full backup and its incrementals
    Restored {
        full_backup_id: i64,
        incrementals_applied: usize,
        tables: i64,
    },
    /// Only departments and users were rebuilt from the core export
    Degraded {
        reason: String,
        departments: usize,
        users: usize,
    },
    /// Nothing could be recovered
    Failed { reason: String },
}

impl RecoveryOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, RecoveryOutcome::Degraded { .. } | RecoveryOutcome::Failed { .. })
    }
}

/// Persistent record of a degraded recovery, kept until acknowledged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedMarker {
    pub raised_at: i64,
    pub outcome: RecoveryOutcome,
}

pub fn marker_path(backup_root: &Path) -> PathBuf {
    backup_root.join(DEGRADED_MARKER_FILE)
}

pub fn raise_degraded(backup_root: &Path, outcome: &RecoveryOutcome) -> Result<()> {
    fs::create_dir_all(backup_root)?;
    let marker = DegradedMarker {
        raised_at: Utc::now().timestamp_millis(),
        outcome: outcome.clone(),
    };
    fs::write(marker_path(backup_root), serde_json::to_vec_pretty(&marker)?)?;
    Ok(())
}

pub fn read_degraded(backup_root: &Path) -> Option<DegradedMarker> {
    let bytes = fs::read(marker_path(backup_root)).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(marker) => Some(marker),
        Err(e) => {
            tracing::warn!("Unreadable degraded marker, treating as raised: {}", e);
            Some(DegradedMarker {
                raised_at: 0,
                outcome: RecoveryOutcome::Failed {
                    reason: "unreadable degraded marker".to_string(),
                },
            })
        }
    }
}

/// Clear the flag; returns whether it was raised
pub fn clear_degraded(backup_root: &Path) -> Result<bool> {
    match fs::remove_file(marker_path(backup_root)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Chain staging
// =============================================================================

fn check_artifact(backup_root: &Path, record: &BackupRecord) -> Result<PathBuf> {
    let path = backup_root.join(&record.file_path);
    if !path.is_file() {
        return Err(AppError::IntegrityFailure(format!("{} is missing", record.file_name)));
    }
    let actual = sha256_file(&path)?;
    if actual != record.checksum {
        return Err(AppError::IntegrityFailure(format!(
            "{} checksum mismatch",
            record.file_name
        )));
    }
    Ok(path)
}

/// Lay out `store.db` and its assembled WAL inside `staging`
fn assemble_chain(
    backup_root: &Path,
    full: &BackupRecord,
    incrementals: &[BackupRecord],
    staging: &Path,
) -> Result<PathBuf> {
    let full_path = check_artifact(backup_root, full)?;
    let full_manifest = read_manifest(&full_path)?;

    let store_path = staging.join(STORE_ENTRY);
    let wal_file = staging.join(STORE_WAL_ENTRY);
    artifact::extract_entry(&full_path, STORE_ENTRY, &store_path)?.ok_or_else(|| {
        AppError::IntegrityFailure(format!("{} has no store file", full.file_name))
    })?;

    let mut wal_len = artifact::extract_entry(&full_path, STORE_WAL_ENTRY, &wal_file)?.unwrap_or(0);
    if wal_len != full_manifest.to_offset {
        return Err(AppError::IntegrityFailure(format!(
            "{} carries {} WAL bytes, manifest says {}",
            full.file_name, wal_len, full_manifest.to_offset
        )));
    }
    let mut salt = full_manifest.salt;

    for inc in incrementals {
        let path = check_artifact(backup_root, inc)?;
        let manifest = read_manifest(&path)?;
        if manifest.base_backup_id != Some(full.id) {
            return Err(AppError::IntegrityFailure(format!(
                "{} is not based on {}",
                inc.file_name, full.file_name
            )));
        }
        if manifest.from_offset != wal_len {
            return Err(AppError::IntegrityFailure(format!(
                "{} starts at WAL offset {}, chain ends at {}",
                inc.file_name, manifest.from_offset, wal_len
            )));
        }
        if salt.is_some() && manifest.salt != salt {
            return Err(AppError::IntegrityFailure(format!(
                "{} belongs to a different WAL generation",
                inc.file_name
            )));
        }

        let segment = artifact::read_entry(&path, WAL_SEGMENT_ENTRY)?.ok_or_else(|| {
            AppError::IntegrityFailure(format!("{} has no WAL segment", inc.file_name))
        })?;
        if manifest.wal_sha256.as_deref() != Some(crate::security::sha256_hex(&segment).as_str()) {
            return Err(AppError::IntegrityFailure(format!(
                "{} WAL segment checksum mismatch",
                inc.file_name
            )));
        }

        let mut out = OpenOptions::new().create(true).append(true).open(&wal_file)?;
        io::Write::write_all(&mut out, &segment)?;
        out.sync_all()?;
        wal_len += segment.len() as u64;
        salt = manifest.salt;
    }

    Ok(store_path)
}

/// Let SQLite recover the assembled WAL, fold it in and check the result
async fn recover_staged(store_path: &Path) -> Result<SmokeReport> {
    let mut conn = SqliteConnectOptions::new()
        .filename(store_path)
        .create_if_missing(false)
        .connect()
        .await?;
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .fetch_one(&mut conn)
        .await?;
    conn.close().await?;

    db::smoke_test(store_path).await
}

/// Stage and recover a chain inside `staging`, returning the recovered store
pub async fn stage_chain(
    backup_root: &Path,
    full: &BackupRecord,
    incrementals: &[BackupRecord],
    staging: &Path,
) -> Result<(PathBuf, SmokeReport)> {
    let root = backup_root.to_path_buf();
    let full_rec = full.clone();
    let incs = incrementals.to_vec();
    let dir = staging.to_path_buf();
    let store_path =
        tokio::task::spawn_blocking(move || assemble_chain(&root, &full_rec, &incs, &dir)).await??;

    let report = recover_staged(&store_path).await?;
    Ok((store_path, report))
}

/// Move `path` and its side files aside with a `.corrupt-<ts>` suffix
fn move_aside(path: &Path) -> io::Result<()> {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    for candidate in [path.to_path_buf(), wal_path(path), side_path(path, "-shm")] {
        if candidate.exists() {
            let mut aside = candidate.as_os_str().to_owned();
            aside.push(format!(".corrupt-{}", stamp));
            tracing::warn!("Moving {:?} aside to {:?}", candidate, aside);
            fs::rename(&candidate, PathBuf::from(aside))?;
        }
    }
    Ok(())
}

fn side_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn install(staged: &Path, target: &Path) -> io::Result<()> {
    move_aside(target)?;
    fs::rename(staged, target)?;
    if let Some(parent) = target.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn staging_dir(target: &Path) -> io::Result<tempfile::TempDir> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    tempfile::Builder::new().prefix(".restore-").tempdir_in(parent)
}

/// Restore the store at `target` from `full` plus `incrementals`
pub async fn restore_chain(
    backup_root: &Path,
    full: &BackupRecord,
    incrementals: &[BackupRecord],
    target: &Path,
) -> Result<SmokeReport> {
    let staging = staging_dir(target)?;
    let (staged, report) = stage_chain(backup_root, full, incrementals, staging.path()).await?;
    install(&staged, target)?;
    tracing::info!(
        "Store restored from {} + {} incremental(s)",
        full.file_name,
        incrementals.len()
    );
    Ok(report)
}

// =============================================================================
// Startup recovery
// =============================================================================

/// Everything the startup guard needs
pub struct RecoveryContext<'a> {
    pub database_path: &'a Path,
    pub backup_root: &'a Path,
    pub core_export_dir: &'a Path,
    pub catalog: &'a Catalog,
}

/// Make sure the store is usable before anything opens it
///
/// Never returns an error: every failure ends up as a `Failed` or `Degraded`
/// outcome, and both raise the persistent degraded marker.
pub async fn check_and_restore(ctx: &RecoveryContext<'_>) -> RecoveryOutcome {
    let outcome = match try_check_and_restore(ctx).await {
        Ok(outcome) => outcome,
        Err(e) => RecoveryOutcome::Failed {
            reason: e.to_string(),
        },
    };

    match &outcome {
        RecoveryOutcome::Healthy => tracing::info!("Store integrity check passed"),
        RecoveryOutcome::Fresh => tracing::info!("No store and no backups yet, starting fresh"),
        RecoveryOutcome::Restored {
            full_backup_id,
            incrementals_applied,
            ..
        } => tracing::warn!(
            "Store recovered from full backup {} with {} incremental(s)",
            full_backup_id,
            incrementals_applied
        ),
        RecoveryOutcome::Degraded { reason, .. } => tracing::error!(
            "DEGRADED RECOVERY: only core data restored from export ({}). Operator action required.",
            reason
        ),
        RecoveryOutcome::Failed { reason } => tracing::error!(
            "STORE RECOVERY FAILED: {}. Service starts without a usable store.",
            reason
        ),
    }

    if outcome.is_degraded() {
        if let Err(e) = raise_degraded(ctx.backup_root, &outcome) {
            tracing::error!("Failed to persist degraded marker: {}", e);
        }
    }
    outcome
}

async fn try_check_and_restore(ctx: &RecoveryContext<'_>) -> Result<RecoveryOutcome> {
    let present = fs::metadata(ctx.database_path)
        .map(|m| m.len() > 0)
        .unwrap_or(false);
    let problem = if present {
        match db::smoke_test(ctx.database_path).await {
            Ok(_) => return Ok(RecoveryOutcome::Healthy),
            Err(e) => format!("store failed smoke test: {}", e),
        }
    } else {
        "store file missing or empty".to_string()
    };
    tracing::warn!("Primary store unusable: {}", problem);

    let fulls: Vec<BackupRecord> = ctx
        .catalog
        .list(Some(BackupClass::Database))
        .await?
        .into_iter()
        .filter(|r| r.kind == BackupKind::Full)
        .collect();

    if !present && fulls.is_empty() && !ctx.database_path.exists() && !core_export_present(ctx.core_export_dir) {
        return Ok(RecoveryOutcome::Fresh);
    }

    for full in &fulls {
        let chain = ctx.catalog.incrementals_of(full.id).await?;
        let usable = contiguous_prefix(ctx.backup_root, full, &chain);
        if usable.len() < chain.len() {
            tracing::warn!(
                "Only {} of {} incremental(s) of {} are usable",
                usable.len(),
                chain.len(),
                full.file_name
            );
        }

        // The full on its own is the last resort for this chain
        let mut attempts = vec![usable];
        if !usable.is_empty() {
            attempts.push(&chain[..0]);
        }
        for incrementals in attempts {
            match restore_chain(ctx.backup_root, full, incrementals, ctx.database_path).await {
                Ok(report) => {
                    return Ok(RecoveryOutcome::Restored {
                        full_backup_id: full.id,
                        incrementals_applied: incrementals.len(),
                        tables: report.tables,
                    })
                }
                Err(e) => tracing::warn!(
                    "Cannot restore from {} with {} incremental(s): {}",
                    full.file_name,
                    incrementals.len(),
                    e
                ),
            }
        }
    }

    let reason = if fulls.is_empty() {
        format!("{}; no database backup available", problem)
    } else {
        format!("{}; no database backup could be restored", problem)
    };
    match restore_core_export(ctx.core_export_dir, ctx.database_path).await {
        Ok((departments, users)) => Ok(RecoveryOutcome::Degraded {
            reason,
            departments,
            users,
        }),
        Err(e) => Ok(RecoveryOutcome::Failed {
            reason: format!("{}; core export unusable: {}", reason, e),
        }),
    }
}

/// Longest run of incrementals, from the start of the chain, that check out
/// and continue the WAL exactly where the previous link ended
fn contiguous_prefix<'a>(
    backup_root: &Path,
    full: &BackupRecord,
    chain: &'a [BackupRecord],
) -> &'a [BackupRecord] {
    let Ok(full_manifest) = check_artifact(backup_root, full).and_then(|p| read_manifest(&p)) else {
        return &chain[..0];
    };
    let mut offset = full_manifest.to_offset;
    let mut salt = full_manifest.salt;

    let mut intact = 0;
    for inc in chain {
        let Ok(manifest) = check_artifact(backup_root, inc).and_then(|p| read_manifest(&p)) else {
            break;
        };
        let continues = manifest.base_backup_id == Some(full.id)
            && manifest.from_offset == offset
            && (salt.is_none() || manifest.salt == salt);
        if !continues {
            tracing::warn!(
                "{} does not continue the chain of {} at WAL offset {}",
                inc.file_name,
                full.file_name,
                offset
            );
            break;
        }
        offset = manifest.to_offset;
        salt = manifest.salt;
        intact += 1;
    }
    &chain[..intact]
}

fn core_export_present(dir: &Path) -> bool {
    dir.join("departments.json").is_file() || dir.join("users.json").is_file()
}

/// Rebuild a minimal store holding departments and users from the plain export
pub async fn restore_core_export(export_dir: &Path, target: &Path) -> Result<(usize, usize)> {
    let departments: Vec<Department> = read_export(&export_dir.join("departments.json"))?;
    let users: Vec<CoreUser> = read_export(&export_dir.join("users.json"))?;
    if departments.is_empty() && users.is_empty() {
        return Err(AppError::StoreUnavailable("core export is empty".to_string()));
    }

    let staging = staging_dir(target)?;
    let staged = staging.path().join(STORE_ENTRY);
    let mut conn = db::store_options(&staged).connect().await?;
    let mut tx = conn.begin().await?;
    for statement in tables::STORE_SCHEMA {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    for d in &departments {
        sqlx::query(
            "INSERT OR REPLACE INTO departments (id, name, parent_id, manager_id, level) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&d.id)
        .bind(&d.name)
        .bind(&d.parent_id)
        .bind(&d.manager_id)
        .bind(d.level)
        .execute(&mut *tx)
        .await?;
    }
    for u in &users {
        sqlx::query(
            "INSERT OR REPLACE INTO users (id, username, name, password, role, department_id, \
             job_title, is_active) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&u.id)
        .bind(&u.username)
        .bind(&u.name)
        .bind(&u.password)
        .bind(&u.role)
        .bind(&u.department_id)
        .bind(&u.job_title)
        .bind(u.is_active)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .fetch_one(&mut conn)
        .await?;
    conn.close().await?;

    install(&staged, target)?;
    Ok((departments.len(), users.len()))
}

fn read_export<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}
