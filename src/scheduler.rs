//! BackupScheduler: in-process timer loop
//!
//! Nothing is remembered between ticks. Every tick re-reads the catalog
//! (newest record per class and kind, plus the persisted job runs) and asks
//! [`due_jobs`] what to start, so a restart neither skips nor repeats a
//! window.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::backup::now_ms;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::constants::RETENTION_SWEEP_INTERVAL_MS;
use crate::error::{AppError, Result};
use crate::models::{BackupClass, BackupKind};
use crate::protection::DataProtection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    DatabaseFull,
    DatabaseIncremental,
    FilesFull,
    FilesIncremental,
    LogArchive,
    Retention,
}

impl Job {
    pub const ALL: [Job; 6] = [
        Job::DatabaseFull,
        Job::DatabaseIncremental,
        Job::FilesFull,
        Job::FilesIncremental,
        Job::LogArchive,
        Job::Retention,
    ];

    /// Key under which the job's runs are persisted
    pub fn name(&self) -> &'static str {
        match self {
            Job::DatabaseFull => "database_full",
            Job::DatabaseIncremental => "database_incremental",
            Job::FilesFull => "files_full",
            Job::FilesIncremental => "files_incremental",
            Job::LogArchive => "log_archive",
            Job::Retention => "retention",
        }
    }

    /// The job a backup run of `class`/`kind` belongs to
    pub fn for_backup(class: BackupClass, kind: BackupKind) -> Job {
        match (class, kind) {
            (BackupClass::Database, BackupKind::Full) => Job::DatabaseFull,
            (BackupClass::Database, BackupKind::Incremental) => Job::DatabaseIncremental,
            (BackupClass::Files, BackupKind::Full) => Job::FilesFull,
            (BackupClass::Files, BackupKind::Incremental) => Job::FilesIncremental,
            (BackupClass::Logs, _) => Job::LogArchive,
        }
    }

    pub fn backup_target(&self) -> Option<(BackupClass, BackupKind)> {
        match self {
            Job::DatabaseFull => Some((BackupClass::Database, BackupKind::Full)),
            Job::DatabaseIncremental => Some((BackupClass::Database, BackupKind::Incremental)),
            Job::FilesFull => Some((BackupClass::Files, BackupKind::Full)),
            Job::FilesIncremental => Some((BackupClass::Files, BackupKind::Incremental)),
            Job::LogArchive => Some((BackupClass::Logs, BackupKind::Full)),
            Job::Retention => None,
        }
    }
}

/// Cadence of every job, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub database_full: i64,
    pub database_incremental: i64,
    pub files_full: i64,
    pub files_incremental: i64,
    pub log_archive: i64,
    pub retention: i64,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            database_full: millis(config.db_full_interval),
            database_incremental: millis(config.db_incremental_interval),
            files_full: millis(config.files_full_interval),
            files_incremental: millis(config.files_incremental_interval),
            log_archive: millis(config.log_archive_interval),
            retention: RETENTION_SWEEP_INTERVAL_MS,
        }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// When each job last happened, as persisted
///
/// Backup jobs are dated by their newest catalog record. An incremental that
/// found nothing new leaves no record, so incrementals also count their last
/// successful job run. The log archiver and the retention sweep produce no
/// record of their own cadence and are dated by their last finished job run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastRuns {
    pub database_full: Option<i64>,
    pub database_incremental: Option<i64>,
    pub files_full: Option<i64>,
    pub files_incremental: Option<i64>,
    pub log_archive: Option<i64>,
    pub retention: Option<i64>,
}

impl LastRuns {
    pub async fn load(catalog: &Catalog) -> Result<Self> {
        let created = |r: Option<crate::models::BackupRecord>| r.map(|r| r.created_at);
        let finished = |r: Option<crate::catalog::JobRun>| r.and_then(|r| r.last_finished_at);
        let succeeded = |r: Option<crate::catalog::JobRun>| r.and_then(|r| r.last_success_at);

        let database_incremental = created(
            catalog
                .latest(BackupClass::Database, BackupKind::Incremental)
                .await?,
        )
        .max(succeeded(catalog.job_run(Job::DatabaseIncremental.name()).await?));
        let files_incremental = created(
            catalog
                .latest(BackupClass::Files, BackupKind::Incremental)
                .await?,
        )
        .max(succeeded(catalog.job_run(Job::FilesIncremental.name()).await?));

        Ok(Self {
            database_full: created(catalog.latest(BackupClass::Database, BackupKind::Full).await?),
            database_incremental,
            files_full: created(catalog.latest(BackupClass::Files, BackupKind::Full).await?),
            files_incremental,
            log_archive: finished(catalog.job_run(Job::LogArchive.name()).await?),
            retention: finished(catalog.job_run(Job::Retention.name()).await?),
        })
    }
}

fn elapsed(now: i64, last: Option<i64>, interval: i64) -> bool {
    match last {
        Some(at) => now.saturating_sub(at) >= interval,
        None => true,
    }
}

/// Jobs due at `now`
///
/// An incremental is measured from the newest backup of its class, full or
/// incremental, and is never started in the same tick as that class's full.
pub fn due_jobs(now: i64, last: &LastRuns, schedule: &Schedule) -> Vec<Job> {
    let mut due = Vec::new();

    let classes = [
        (
            Job::DatabaseFull,
            Job::DatabaseIncremental,
            last.database_full,
            last.database_incremental,
            schedule.database_full,
            schedule.database_incremental,
        ),
        (
            Job::FilesFull,
            Job::FilesIncremental,
            last.files_full,
            last.files_incremental,
            schedule.files_full,
            schedule.files_incremental,
        ),
    ];
    for (full_job, inc_job, full_at, inc_at, full_every, inc_every) in classes {
        if elapsed(now, full_at, full_every) {
            due.push(full_job);
        } else if elapsed(now, full_at.max(inc_at), inc_every) {
            due.push(inc_job);
        }
    }

    if elapsed(now, last.log_archive, schedule.log_archive) {
        due.push(Job::LogArchive);
    }
    if elapsed(now, last.retention, schedule.retention) {
        due.push(Job::Retention);
    }
    due
}

pub struct BackupScheduler {
    protection: Arc<DataProtection>,
    schedule: Schedule,
    tick: Duration,
}

impl BackupScheduler {
    pub fn new(protection: Arc<DataProtection>, config: &Config) -> Self {
        Self {
            protection,
            schedule: Schedule::from_config(config),
            tick: config.scheduler_tick,
        }
    }

    /// Run the loop until the runtime shuts down
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Backup scheduler started, tick every {:?}", self.tick);
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.tick_once().await;
            }
        })
    }

    /// Start every due job and wait for all of them
    ///
    /// Each job runs in its own task, so jobs of different classes overlap
    /// and a panicking job is recorded as a failure instead of ending the loop.
    pub async fn tick_once(&self) -> Vec<Job> {
        let last = match LastRuns::load(self.protection.catalog()).await {
            Ok(last) => last,
            Err(e) => {
                tracing::error!("Scheduler could not read the catalog: {}", e);
                return Vec::new();
            }
        };
        let due = due_jobs(now_ms(), &last, &self.schedule);
        if due.is_empty() {
            return due;
        }
        tracing::debug!("Scheduler tick: {:?} due", due);

        let handles: Vec<_> = due
            .iter()
            .map(|&job| {
                let protection = self.protection.clone();
                (job, tokio::spawn(async move { protection.run_job(job).await }))
            })
            .collect();

        for (job, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(AppError::BackupInProgress(class))) => {
                    tracing::info!("Scheduled {} skipped: a {} run is in progress", job.name(), class);
                }
                Ok(Err(e)) => tracing::error!("Scheduled {} failed: {}", job.name(), e),
                Err(e) => {
                    tracing::error!("Scheduled {} panicked: {}", job.name(), e);
                    let message = format!("job panicked: {}", e);
                    if let Err(e) = self
                        .protection
                        .catalog()
                        .record_job_finish(job.name(), now_ms(), Some(&message))
                        .await
                    {
                        tracing::error!("Could not record failure of {}: {}", job.name(), e);
                    }
                }
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DAY_MS;

    const HOUR: i64 = 3_600_000;

    fn schedule() -> Schedule {
        Schedule {
            database_full: DAY_MS,
            database_incremental: HOUR,
            files_full: DAY_MS,
            files_incremental: HOUR,
            log_archive: 15 * DAY_MS,
            retention: DAY_MS,
        }
    }

    #[test]
    fn test_everything_due_on_first_start() {
        let due = due_jobs(100 * DAY_MS, &LastRuns::default(), &schedule());
        assert_eq!(
            due,
            vec![Job::DatabaseFull, Job::FilesFull, Job::LogArchive, Job::Retention]
        );
    }

    #[test]
    fn test_restart_mid_interval_recomputes_from_records() {
        let now = 100 * DAY_MS;
        let last = LastRuns {
            database_full: Some(now - 2 * HOUR),
            database_incremental: Some(now - 30 * 60_000),
            files_full: Some(now - 3 * HOUR),
            files_incremental: None,
            log_archive: Some(now - DAY_MS),
            retention: Some(now - HOUR),
        };
        // files: last backup of the class is the full, three hours old
        assert_eq!(due_jobs(now, &last, &schedule()), vec![Job::FilesIncremental]);
    }

    #[test]
    fn test_full_due_suppresses_incremental() {
        let now = 100 * DAY_MS;
        let last = LastRuns {
            database_full: Some(now - 2 * DAY_MS),
            database_incremental: Some(now - 2 * HOUR),
            files_full: Some(now),
            files_incremental: Some(now),
            log_archive: Some(now),
            retention: Some(now),
        };
        assert_eq!(due_jobs(now, &last, &schedule()), vec![Job::DatabaseFull]);
    }

    #[test]
    fn test_nothing_due_right_after_runs() {
        let now = 100 * DAY_MS;
        let last = LastRuns {
            database_full: Some(now),
            database_incremental: None,
            files_full: Some(now - 10 * 60_000),
            files_incremental: Some(now - 5 * 60_000),
            log_archive: Some(now - 14 * DAY_MS),
            retention: Some(now - 23 * HOUR),
        };
        assert!(due_jobs(now, &last, &schedule()).is_empty());
    }

    #[test]
    fn test_job_names_round_trip_through_targets() {
        for job in Job::ALL {
            if let Some((class, kind)) = job.backup_target() {
                assert_eq!(Job::for_backup(class, kind), job);
            }
        }
        assert_eq!(Job::for_backup(BackupClass::Logs, BackupKind::Incremental), Job::LogArchive);
    }
}
