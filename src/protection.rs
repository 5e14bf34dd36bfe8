//! DataProtection: the one entry point for backups, status and verification
//!
//! Built once in `main` after the startup recovery check and shared as an
//! `Arc` by the HTTP layer and the scheduler. Each backup class has its own
//! run guard; a second run of a class that is already running is refused
//! with [`AppError::BackupInProgress`], never queued. Runs of different
//! classes proceed concurrently.
//!
//! Every run ends as a [`RunOutcome`]; engine errors never escape as panics
//! or bubble past this layer.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use crate::archiver::{ArchiveRun, LogArchiver};
use crate::audit_log::{AuditLogWriter, AuditPruneHandle};
use crate::backup::files::FilesRestoreReport;
use crate::backup::{
    now_ms, retention, DatabaseBackupEngine, FileStoreBackupEngine, RetentionPolicy,
    RetentionReport,
};
use crate::catalog::{Catalog, JobRun};
use crate::config::Config;
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::file_index::FileMetadataIndex;
use crate::models::{BackupClass, BackupKind, BackupRecord, BackupRun, BackupStats, RunOutcome};
use crate::restore::{self, DegradedMarker, RecoveryOutcome};
use crate::scheduler::Job;
use crate::security::{resolve_within, validate_artifact_name};
use crate::verify::{self, VerifyReport};

/// Health of one backup class
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatus {
    pub class: BackupClass,
    pub last_full: Option<BackupRecord>,
    pub last_incremental: Option<BackupRecord>,
    pub in_progress: bool,
    pub last_error: Option<String>,
    pub stats: BackupStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionStatus {
    pub healthy: bool,
    pub classes: Vec<ClassStatus>,
    pub failed_verifications: Vec<BackupRecord>,
    pub jobs: Vec<JobRun>,
    pub recovery: RecoveryOutcome,
    pub degraded: Option<DegradedMarker>,
    pub generated_at: i64,
}

/// An artifact cleared for download
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub record: BackupRecord,
    pub path: PathBuf,
    pub size_bytes: u64,
}

struct RunGuards {
    database: Mutex<()>,
    files: Mutex<()>,
    logs: Mutex<()>,
}

impl RunGuards {
    fn new() -> Self {
        Self {
            database: Mutex::new(()),
            files: Mutex::new(()),
            logs: Mutex::new(()),
        }
    }

    fn get(&self, class: BackupClass) -> &Mutex<()> {
        match class {
            BackupClass::Database => &self.database,
            BackupClass::Files => &self.files,
            BackupClass::Logs => &self.logs,
        }
    }
}

pub struct DataProtection {
    store: Store,
    catalog: Catalog,
    backup_root: PathBuf,
    database: DatabaseBackupEngine,
    files: FileStoreBackupEngine,
    archiver: LogArchiver,
    audit_log: AuditLogWriter,
    file_index: FileMetadataIndex,
    policy: RetentionPolicy,
    log_live_retention_days: i64,
    log_archive_retention_days: i64,
    guards: RunGuards,
    recovery: RecoveryOutcome,
}

impl DataProtection {
    /// Wire the engines to an open store and catalog
    ///
    /// `recovery` is the result of the startup check that ran before the
    /// store was opened; it is reported by [`DataProtection::status`].
    pub fn new(config: &Config, store: Store, catalog: Catalog, recovery: RecoveryOutcome) -> Self {
        let file_index = FileMetadataIndex::new(store.clone());
        let audit_log = AuditLogWriter::new(store.clone());

        let database = DatabaseBackupEngine::new(
            store.clone(),
            config.database_path.clone(),
            config.backup_root.clone(),
            catalog.clone(),
            config.checkpoint_timeout,
        );
        let files = FileStoreBackupEngine::new(
            file_index.clone(),
            config.uploads_dir.clone(),
            config.backup_root.clone(),
            config.file_index_dir.clone(),
            catalog.clone(),
        );
        let archiver = LogArchiver::new(
            audit_log.clone(),
            AuditPruneHandle::new(store.clone()),
            catalog.clone(),
            config.backup_root.clone(),
        );

        Self {
            store,
            catalog,
            backup_root: config.backup_root.clone(),
            database,
            files,
            archiver,
            audit_log,
            file_index,
            policy: config.retention_policy(),
            log_live_retention_days: config.log_live_retention_days,
            log_archive_retention_days: config.log_archive_retention_days,
            guards: RunGuards::new(),
            recovery,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Append handle for the application's audit trail
    pub fn audit_log(&self) -> &AuditLogWriter {
        &self.audit_log
    }

    /// Write-path handle for the upload metadata index
    pub fn file_index(&self) -> &FileMetadataIndex {
        &self.file_index
    }

    pub fn archiver(&self) -> &LogArchiver {
        &self.archiver
    }

    fn lock(&self, class: BackupClass) -> Result<MutexGuard<'_, ()>> {
        self.guards
            .get(class)
            .try_lock()
            .map_err(|_| AppError::BackupInProgress(class))
    }

    pub fn in_progress(&self, class: BackupClass) -> bool {
        self.guards.get(class).try_lock().is_err()
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Run one backup of `class`
    ///
    /// Only an overlapping run is an error; any failure of the run itself is
    /// reported inside the returned outcome.
    pub async fn run(&self, class: BackupClass, kind: BackupKind) -> Result<RunOutcome> {
        let _guard = self.lock(class)?;
        let job = Job::for_backup(class, kind);
        let started_at = now_ms();
        self.job_started(job, started_at).await;
        tracing::info!("Starting {} {} backup", class, kind);

        let result = match (class, kind) {
            (BackupClass::Database, BackupKind::Full) => self.database.run_full_backup().await,
            (BackupClass::Database, BackupKind::Incremental) => {
                self.database.run_incremental_backup().await
            }
            (BackupClass::Files, BackupKind::Full) => self.files.run_full_backup().await,
            (BackupClass::Files, BackupKind::Incremental) => {
                self.files.run_incremental_backup().await
            }
            (BackupClass::Logs, _) => self.run_log_archive().await,
        };

        let outcome = match result {
            Ok(run) => {
                let outcome = RunOutcome::from_run(class, kind, started_at, run);
                if let Some(reason) = &outcome.fallback {
                    tracing::warn!("{} incremental fell back to a full backup: {}", class, reason);
                }
                match &outcome.record {
                    Some(record) => tracing::info!(
                        "{} {} backup finished: {} ({} bytes)",
                        class,
                        record.kind,
                        record.file_name,
                        record.size_bytes
                    ),
                    None => tracing::info!(
                        "{} {} backup skipped: {}",
                        class,
                        kind,
                        outcome.message.as_deref().unwrap_or("nothing to do")
                    ),
                }
                outcome
            }
            Err(e) => {
                tracing::error!("{} {} backup failed: {}", class, kind, e);
                RunOutcome::failed(class, kind, started_at, &e)
            }
        };

        self.job_finished(job, outcome.message.as_deref().filter(|_| outcome.is_failed()))
            .await;
        Ok(outcome)
    }

    /// Archive aged audit-log rows, then drop archives past the compliance horizon
    async fn run_log_archive(&self) -> Result<BackupRun> {
        let ArchiveRun {
            archives,
            rows_archived,
            ..
        } = self
            .archiver
            .prune_live_table(self.log_live_retention_days)
            .await?;

        let expired = self
            .archiver
            .prune_archives(self.log_archive_retention_days)
            .await?;
        if !expired.is_empty() {
            tracing::info!("Removed {} archive(s) past the retention horizon", expired.len());
        }

        let Some(last) = archives.last() else {
            return Ok(BackupRun::skipped(format!(
                "no audit-log rows older than {} day(s)",
                self.log_live_retention_days
            )));
        };
        let record = self.catalog.get(last.record_id).await?;
        tracing::info!(
            "Archived {} audit-log row(s) into {} archive(s)",
            rows_archived,
            archives.len()
        );
        Ok(BackupRun::completed(record))
    }

    /// Manual full backup of one class
    ///
    /// For logs this is an archiving pass over the live table.
    pub async fn trigger(&self, class: BackupClass) -> Result<RunOutcome> {
        self.run(class, BackupKind::Full).await
    }

    /// Full database and files backups, run side by side
    pub async fn manual_backup(&self) -> Vec<RunOutcome> {
        let started_at = now_ms();
        let (database, files) = tokio::join!(
            self.trigger(BackupClass::Database),
            self.trigger(BackupClass::Files)
        );
        [(BackupClass::Database, database), (BackupClass::Files, files)]
            .into_iter()
            .map(|(class, result)| {
                result.unwrap_or_else(|e| RunOutcome::failed(class, BackupKind::Full, started_at, &e))
            })
            .collect()
    }

    /// Entry point for the scheduler
    pub async fn run_job(&self, job: Job) -> Result<()> {
        match job.backup_target() {
            Some((class, kind)) => self.run(class, kind).await.map(|_| ()),
            None => self.retention_sweep().await.map(|_| ()),
        }
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Apply the retention policy to database and files backups
    ///
    /// A class whose backup is running is skipped this time. Log archives
    /// follow their own horizon through the archiver.
    pub async fn retention_sweep(&self) -> Result<Vec<RetentionReport>> {
        let job = Job::Retention;
        self.job_started(job, now_ms()).await;

        let mut reports = Vec::new();
        let mut failure = None;
        for class in [BackupClass::Database, BackupClass::Files] {
            let Ok(_guard) = self.lock(class) else {
                tracing::info!("Retention for {} postponed: backup in progress", class);
                continue;
            };
            match retention::sweep(&self.catalog, &self.backup_root, class, self.policy, now_ms())
                .await
            {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!("Retention sweep for {} failed: {}", class, e);
                    failure = Some(e);
                    break;
                }
            }
        }

        let message = failure.as_ref().map(|e| e.to_string());
        self.job_finished(job, message.as_deref()).await;
        match failure {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    /// Operator deletion of one backup, refused for a full with live incrementals
    pub async fn delete_backup(&self, id: i64) -> Result<BackupRecord> {
        let record = retention::delete_backup(&self.catalog, &self.backup_root, id).await?;
        tracing::info!("Deleted backup {} ({})", record.id, record.file_name);
        Ok(record)
    }

    // =========================================================================
    // Read side
    // =========================================================================

    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        self.catalog.list(None).await
    }

    pub async fn stats(&self, class: BackupClass) -> Result<BackupStats> {
        match class {
            BackupClass::Database => self.database.stats().await,
            BackupClass::Files => self.files.stats().await,
            BackupClass::Logs => self.archiver.stats().await,
        }
    }

    pub async fn status(&self) -> Result<ProtectionStatus> {
        let jobs = self.catalog.job_runs().await?;
        let records = self.catalog.list(None).await?;

        let mut classes = Vec::with_capacity(BackupClass::ALL.len());
        for class in BackupClass::ALL {
            let newest = |kind: BackupKind| {
                records
                    .iter()
                    .find(|r| r.class == class && r.kind == kind)
                    .cloned()
            };
            let last_error = jobs
                .iter()
                .filter(|run| {
                    [BackupKind::Full, BackupKind::Incremental]
                        .iter()
                        .any(|&kind| Job::for_backup(class, kind).name() == run.job)
                })
                .filter_map(|run| run.last_error.clone())
                .next();

            classes.push(ClassStatus {
                class,
                last_full: newest(BackupKind::Full),
                last_incremental: newest(BackupKind::Incremental),
                in_progress: self.in_progress(class),
                last_error,
                stats: self.stats(class).await?,
            });
        }

        let failed_verifications: Vec<BackupRecord> = records
            .into_iter()
            .filter(BackupRecord::failed_verification)
            .collect();
        let degraded = restore::read_degraded(&self.backup_root);
        let healthy = degraded.is_none()
            && failed_verifications.is_empty()
            && classes.iter().all(|c| c.last_error.is_none());

        Ok(ProtectionStatus {
            healthy,
            classes,
            failed_verifications,
            jobs,
            recovery: self.recovery.clone(),
            degraded,
            generated_at: now_ms(),
        })
    }

    pub async fn verify(&self, filename: &str) -> Result<VerifyReport> {
        verify::verify_backup(&self.catalog, &self.backup_root, filename).await
    }

    /// Resolve a download request to a registered, non-empty artifact
    ///
    /// The name must match an artifact pattern, be known to the catalog and
    /// resolve to a real path inside the backup root.
    pub async fn download_target(&self, filename: &str) -> Result<DownloadTarget> {
        validate_artifact_name(filename)?;
        let record = self
            .catalog
            .find_by_file_name(filename)
            .await?
            .ok_or(AppError::BackupNotFound)?;
        let path = resolve_within(&self.backup_root, &record.file_path)?;

        let size_bytes = tokio::fs::metadata(&path).await?.len();
        if size_bytes == 0 {
            return Err(AppError::IntegrityFailure(format!(
                "{} is empty",
                record.file_name
            )));
        }
        Ok(DownloadTarget {
            record,
            path,
            size_bytes,
        })
    }

    /// Rebuild the upload tree under `dest` from the newest files chain
    pub async fn restore_files_to(&self, dest: &Path) -> Result<FilesRestoreReport> {
        let _guard = self.lock(BackupClass::Files)?;
        self.files.restore_files_to(dest).await
    }

    pub fn degraded(&self) -> Option<DegradedMarker> {
        restore::read_degraded(&self.backup_root)
    }

    /// Operator acknowledgement of a degraded recovery
    pub fn acknowledge_degraded(&self) -> Result<bool> {
        let cleared = restore::clear_degraded(&self.backup_root)?;
        if cleared {
            tracing::warn!("Degraded recovery flag acknowledged by operator");
        }
        Ok(cleared)
    }

    /// Whether the store answers a trivial query
    pub async fn store_connected(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.store).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Store health check failed: {:?}", e);
                false
            }
        }
    }

    // =========================================================================
    // Job bookkeeping
    // =========================================================================

    async fn job_started(&self, job: Job, at: i64) {
        if let Err(e) = self.catalog.record_job_start(job.name(), at).await {
            tracing::warn!("Could not record start of {}: {}", job.name(), e);
        }
    }

    async fn job_finished(&self, job: Job, error: Option<&str>) {
        if let Err(e) = self.catalog.record_job_finish(job.name(), now_ms(), error).await {
            tracing::warn!("Could not record end of {}: {}", job.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_store_pool, init_store_schema, store_options};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn protection(dir: &Path) -> DataProtection {
        let config = Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            environment: "test".to_string(),
            allowed_origins: Vec::new(),
            database_path: dir.join("app.db"),
            uploads_dir: dir.join("uploads"),
            backup_root: dir.join("backups"),
            file_index_dir: dir.join("file-index"),
            core_export_dir: dir.join("core_data"),
            db_full_interval: Duration::from_secs(86_400),
            db_incremental_interval: Duration::from_secs(3600),
            files_full_interval: Duration::from_secs(86_400),
            files_incremental_interval: Duration::from_secs(3600),
            log_archive_interval: Duration::from_secs(15 * 86_400),
            log_live_retention_days: 90,
            log_archive_retention_days: 3650,
            retention_max_age_days: 30,
            retention_min_keep: 3,
            checkpoint_timeout: Duration::from_secs(5),
            scheduler_tick: Duration::from_secs(60),
            scheduler_enabled: false,
        };
        let catalog = Catalog::open(&config.backup_root).await.unwrap();
        let store = create_store_pool(store_options(&config.database_path));
        init_store_schema(&store).await.unwrap();
        DataProtection::new(&config, store, catalog, RecoveryOutcome::Healthy)
    }

    #[tokio::test]
    async fn test_same_class_run_is_refused_while_one_is_running() {
        let dir = TempDir::new().unwrap();
        let protection = protection(dir.path()).await;

        let held = protection.lock(BackupClass::Files).unwrap();
        assert!(protection.in_progress(BackupClass::Files));
        let result = protection.run(BackupClass::Files, BackupKind::Full).await;
        assert!(matches!(result, Err(AppError::BackupInProgress(BackupClass::Files))));

        // Other classes are unaffected
        let outcome = protection
            .run(BackupClass::Database, BackupKind::Full)
            .await
            .unwrap();
        assert!(!outcome.is_failed());

        drop(held);
        assert!(!protection.in_progress(BackupClass::Files));
        let outcome = protection.run(BackupClass::Files, BackupKind::Full).await.unwrap();
        assert!(!outcome.is_failed());
    }

    #[tokio::test]
    async fn test_status_is_healthy_after_successful_runs() {
        let dir = TempDir::new().unwrap();
        let protection = protection(dir.path()).await;
        protection.manual_backup().await;

        let status = protection.status().await.unwrap();
        assert!(status.healthy);
        assert!(status.degraded.is_none());
        assert_eq!(status.classes.len(), 3);
        assert!(status.classes.iter().all(|c| !c.in_progress));
    }
}
