//! Artifact verification
//!
//! Checks the stored checksum and that the archive reads back. Database
//! artifacts are additionally restored into a throwaway directory and
//! smoke-tested there, never against the live store. A failed verification
//! is recorded on the record and reported; the artifact is left alone.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::archiver::read_archive;
use crate::artifact;
use crate::backup::files::{self, FilesManifest};
use crate::backup::now_ms;
use crate::catalog::Catalog;
use crate::constants::FILES_ENTRY_PREFIX;
use crate::db::SmokeReport;
use crate::error::{AppError, Result};
use crate::models::{BackupClass, BackupKind, BackupRecord, VerifyStatus};
use crate::restore;
use crate::security::{resolve_within, sha256_file, validate_artifact_name};

/// Integrity report for one artifact
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub filename: String,
    pub class: BackupClass,
    pub kind: BackupKind,
    pub ok: bool,
    pub checksum_ok: bool,
    pub archive_ok: bool,
    /// Database artifacts: result of the isolated load-and-query test
    pub smoke_test: Option<SmokeReport>,
    pub items_checked: i64,
    pub problems: Vec<String>,
    pub verified_at: i64,
}

/// Verify the artifact called `filename` and persist the verdict
pub async fn verify_backup(catalog: &Catalog, backup_root: &Path, filename: &str) -> Result<VerifyReport> {
    validate_artifact_name(filename)?;
    let record = catalog
        .find_by_file_name(filename)
        .await?
        .ok_or(AppError::BackupNotFound)?;

    let mut report = VerifyReport {
        filename: record.file_name.clone(),
        class: record.class,
        kind: record.kind,
        ok: false,
        checksum_ok: false,
        archive_ok: false,
        smoke_test: None,
        items_checked: 0,
        problems: Vec::new(),
        verified_at: now_ms(),
    };

    match resolve_within(backup_root, &record.file_path) {
        Ok(path) => check(catalog, backup_root, &record, &path, &mut report).await,
        Err(AppError::BackupNotFound) => report.problems.push("artifact file is missing".to_string()),
        Err(e) => return Err(e),
    }

    report.ok = report.problems.is_empty();
    let status = if report.ok {
        VerifyStatus::Ok
    } else {
        VerifyStatus::Failed
    };
    catalog
        .set_verify_status(record.id, status, report.verified_at)
        .await?;

    if report.ok {
        tracing::info!("Verification of {} passed", record.file_name);
    } else {
        tracing::error!(
            "Verification of {} failed: {}",
            record.file_name,
            report.problems.join("; ")
        );
    }
    Ok(report)
}

async fn check(
    catalog: &Catalog,
    backup_root: &Path,
    record: &BackupRecord,
    path: &Path,
    report: &mut VerifyReport,
) {
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || sha256_file(&owned)).await {
        Ok(Ok(actual)) if actual == record.checksum => report.checksum_ok = true,
        Ok(Ok(_)) => report.problems.push("checksum mismatch".to_string()),
        Ok(Err(e)) => report.problems.push(format!("cannot read artifact: {}", e)),
        Err(e) => report.problems.push(format!("checksum task failed: {}", e)),
    }
    if !report.checksum_ok {
        return;
    }

    let result = match record.class {
        BackupClass::Database => check_database(catalog, backup_root, record, report).await,
        BackupClass::Files => check_files(path.to_path_buf(), report).await,
        BackupClass::Logs => check_logs(catalog, record, path.to_path_buf(), report).await,
    };
    if let Err(e) = result {
        report.problems.push(e.to_string());
    }
}

async fn check_database(
    catalog: &Catalog,
    backup_root: &Path,
    record: &BackupRecord,
    report: &mut VerifyReport,
) -> Result<()> {
    let (full, incrementals) = match record.kind {
        BackupKind::Full => (record.clone(), Vec::new()),
        BackupKind::Incremental => {
            let base_id = record.base_backup_id.ok_or_else(|| {
                AppError::IntegrityFailure("incremental without a base backup".to_string())
            })?;
            let full = catalog.get(base_id).await?;
            let chain: Vec<BackupRecord> = catalog
                .incrementals_of(base_id)
                .await?
                .into_iter()
                .take_while(|r| r.created_at <= record.created_at)
                .collect();
            (full, chain)
        }
    };

    let scratch = tempfile::TempDir::new()?;
    let (_, smoke) = restore::stage_chain(backup_root, &full, &incrementals, scratch.path()).await?;
    report.archive_ok = true;
    report.items_checked = 1 + incrementals.len() as i64;
    report.smoke_test = Some(smoke);
    Ok(())
}

async fn check_files(path: PathBuf, report: &mut VerifyReport) -> Result<()> {
    let (manifest, sizes) = tokio::task::spawn_blocking(move || {
        let manifest: FilesManifest = files::read_manifest(&path)?;
        let mut sizes = HashMap::new();
        let mut archive = artifact::open_tar_gz(&path)?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            if let Some(rel) = name.strip_prefix(FILES_ENTRY_PREFIX) {
                let rel = rel.to_string();
                let n = std::io::copy(&mut entry, &mut std::io::sink())?;
                sizes.insert(rel, n as i64);
            }
        }
        Ok::<_, AppError>((manifest, sizes))
    })
    .await??;

    report.archive_ok = true;
    for entry in &manifest.entries {
        match sizes.get(&entry.path) {
            Some(size) if *size == entry.size => {}
            Some(size) => report.problems.push(format!(
                "{}: {} bytes in archive, {} in manifest",
                entry.path, size, entry.size
            )),
            None => report
                .problems
                .push(format!("{}: listed in manifest but not archived", entry.path)),
        }
    }
    report.items_checked = manifest.entries.len() as i64;
    Ok(())
}

async fn check_logs(
    catalog: &Catalog,
    record: &BackupRecord,
    path: PathBuf,
    report: &mut VerifyReport,
) -> Result<()> {
    let rows = tokio::task::spawn_blocking(move || read_archive(&path)).await??;
    report.archive_ok = true;
    report.items_checked = rows.len() as i64;

    if let Some(manifest) = catalog.manifest_for_record(record.id).await? {
        if manifest.row_count != rows.len() as i64 {
            report.problems.push(format!(
                "archive holds {} rows, manifest says {}",
                rows.len(),
                manifest.row_count
            ));
        }
    } else {
        report.problems.push("no archive manifest".to_string());
    }
    Ok(())
}
