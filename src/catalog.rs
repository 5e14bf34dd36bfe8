//! Durable catalog of backup artifacts, archive manifests and job runs
//!
//! Lives in its own SQLite file under the backup root, so losing the primary
//! store never loses the list of backups that could bring it back.

use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

use crate::artifact;
use crate::db::{create_catalog_pool, init_catalog_schema};
use crate::error::{AppError, Result};
use crate::models::{
    ArchiveManifest, BackupClass, BackupKind, BackupRecord, BackupStats, KindStats,
    NewBackupRecord, VerifyStatus, Watermark,
};

const RECORD_COLUMNS: &str = "id, class, kind, file_name, file_path, size_bytes, created_at, \
     base_backup_id, checksum, watermark, item_count, note, verify_status, verified_at";

/// Last known state of one scheduled job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub job: String,
    pub last_started_at: Option<i64>,
    pub last_finished_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (or create) the catalog under `backup_root`
    pub async fn open(backup_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(backup_root)?;
        let pool = create_catalog_pool(&artifact::catalog_path(backup_root)).await?;
        init_catalog_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Backup records
    // =========================================================================

    pub async fn insert_record(&self, new: &NewBackupRecord) -> Result<BackupRecord> {
        let mut tx = self.pool.begin().await?;
        let id = insert_record_in(&mut tx, new).await?;
        tx.commit().await?;
        self.get(id).await
    }

    /// Register a log archive and its manifest atomically
    pub async fn insert_log_archive(
        &self,
        new: &NewBackupRecord,
        first_log_id: i64,
        last_log_id: i64,
        covered_from: i64,
        covered_to: i64,
    ) -> Result<(BackupRecord, ArchiveManifest)> {
        let mut tx = self.pool.begin().await?;
        let record_id = insert_record_in(&mut tx, new).await?;

        sqlx::query(
            "INSERT INTO archive_manifests (record_id, archive_file, covered_from, covered_to, \
             first_log_id, last_log_id, row_count, checksum, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record_id)
        .bind(&new.file_name)
        .bind(covered_from)
        .bind(covered_to)
        .bind(first_log_id)
        .bind(last_log_id)
        .bind(new.item_count)
        .bind(&new.checksum)
        .bind(new.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let record = self.get(record_id).await?;
        let manifest = self
            .manifest_for_record(record_id)
            .await?
            .ok_or(AppError::BackupNotFound)?;
        Ok((record, manifest))
    }

    pub async fn get(&self, id: i64) -> Result<BackupRecord> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM backup_records WHERE id = ?",
            RECORD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::BackupNotFound)?;
        record_from_row(&row)
    }

    pub async fn find_by_file_name(&self, file_name: &str) -> Result<Option<BackupRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM backup_records WHERE file_name = ?",
            RECORD_COLUMNS
        ))
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// All records, newest first, optionally restricted to one class
    pub async fn list(&self, class: Option<BackupClass>) -> Result<Vec<BackupRecord>> {
        let rows = match class {
            Some(class) => {
                sqlx::query(&format!(
                    "SELECT {} FROM backup_records WHERE class = ? \
                     ORDER BY created_at DESC, id DESC",
                    RECORD_COLUMNS
                ))
                .bind(class.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM backup_records ORDER BY created_at DESC, id DESC",
                    RECORD_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(record_from_row).collect()
    }

    pub async fn latest(&self, class: BackupClass, kind: BackupKind) -> Result<Option<BackupRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM backup_records WHERE class = ? AND kind = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            RECORD_COLUMNS
        ))
        .bind(class.as_str())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Newest full of `class` together with its incrementals, oldest first
    pub async fn latest_chain(&self, class: BackupClass) -> Result<Option<(BackupRecord, Vec<BackupRecord>)>> {
        let Some(full) = self.latest(class, BackupKind::Full).await? else {
            return Ok(None);
        };
        let incrementals = self.incrementals_of(full.id).await?;
        Ok(Some((full, incrementals)))
    }

    /// Incrementals based on `full_id`, in application order
    pub async fn incrementals_of(&self, full_id: i64) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM backup_records WHERE base_backup_id = ? \
             ORDER BY created_at ASC, id ASC",
            RECORD_COLUMNS
        ))
        .bind(full_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Remove a record, refusing to orphan incrementals
    ///
    /// A full goes only once it has no incrementals left, and an incremental
    /// only when it is the tip of its chain. The artifact file is the caller's
    /// business; the record goes first so a crash in between leaves an
    /// unreferenced file, never a dangling record.
    pub async fn delete_record(&self, id: i64) -> Result<BackupRecord> {
        let record = self.get(id).await?;
        let mut tx = self.pool.begin().await?;

        if let Some(base) = record.base_backup_id {
            let later: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM backup_records WHERE base_backup_id = ? \
                 AND (created_at > ? OR (created_at = ? AND id > ?))",
            )
            .bind(base)
            .bind(record.created_at)
            .bind(record.created_at)
            .bind(record.id)
            .fetch_one(&mut *tx)
            .await?;
            if later > 0 {
                return Err(AppError::RetentionViolation(format!(
                    "{} is followed by {} later incremental backup(s) in its chain",
                    record.file_name, later
                )));
            }
        }

        let dependents: i64 =
            sqlx::query_scalar("SELECT count(*) FROM backup_records WHERE base_backup_id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        if dependents > 0 {
            return Err(AppError::RetentionViolation(format!(
                "{} still has {} incremental backup(s) depending on it",
                record.file_name, dependents
            )));
        }

        sqlx::query("DELETE FROM backup_records WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn set_verify_status(&self, id: i64, status: VerifyStatus, at: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE backup_records SET verify_status = ?, verified_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(at)
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::BackupNotFound);
        }
        Ok(())
    }

    pub async fn stats(&self, class: BackupClass) -> Result<BackupStats> {
        let rows = sqlx::query(
            "SELECT kind, count(*) AS n, coalesce(sum(size_bytes), 0) AS total, \
             max(created_at) AS latest FROM backup_records WHERE class = ? GROUP BY kind",
        )
        .bind(class.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut stats = BackupStats::default();
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let entry = KindStats {
                count: row.try_get("n")?,
                total_size_bytes: row.try_get("total")?,
                latest_at: row.try_get("latest")?,
            };
            match kind.parse::<BackupKind>()? {
                BackupKind::Full => stats.full = entry,
                BackupKind::Incremental => stats.incremental = entry,
            }
        }
        Ok(stats)
    }

    // =========================================================================
    // Archive manifests
    // =========================================================================

    pub async fn manifest_for_record(&self, record_id: i64) -> Result<Option<ArchiveManifest>> {
        let row = sqlx::query(
            "SELECT record_id, archive_file, covered_from, covered_to, first_log_id, \
             last_log_id, row_count, checksum, created_at \
             FROM archive_manifests WHERE record_id = ?",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(manifest_from_row).transpose()
    }

    /// Manifest describing exactly these rows, if one was already written
    pub async fn find_manifest(
        &self,
        first_log_id: i64,
        last_log_id: i64,
        covered_from: i64,
        covered_to: i64,
        row_count: i64,
    ) -> Result<Option<ArchiveManifest>> {
        let row = sqlx::query(
            "SELECT record_id, archive_file, covered_from, covered_to, first_log_id, \
             last_log_id, row_count, checksum, created_at \
             FROM archive_manifests WHERE first_log_id = ? AND last_log_id = ? \
             AND covered_from = ? AND covered_to = ? AND row_count = ? \
             ORDER BY record_id DESC LIMIT 1",
        )
        .bind(first_log_id)
        .bind(last_log_id)
        .bind(covered_from)
        .bind(covered_to)
        .bind(row_count)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(manifest_from_row).transpose()
    }

    /// Manifests whose content ends before `cutoff` (unix ms)
    pub async fn manifests_covered_before(&self, cutoff: i64) -> Result<Vec<ArchiveManifest>> {
        let rows = sqlx::query(
            "SELECT record_id, archive_file, covered_from, covered_to, first_log_id, \
             last_log_id, row_count, checksum, created_at \
             FROM archive_manifests WHERE covered_to < ? ORDER BY covered_to ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(manifest_from_row).collect()
    }

    // =========================================================================
    // Job runs
    // =========================================================================

    pub async fn record_job_start(&self, job: &str, at: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_runs (job, last_started_at) VALUES (?, ?) \
             ON CONFLICT (job) DO UPDATE SET last_started_at = excluded.last_started_at",
        )
        .bind(job)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_job_finish(&self, job: &str, at: i64, error: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_runs (job, last_finished_at, last_success_at, last_error) \
             VALUES (?1, ?2, CASE WHEN ?3 IS NULL THEN ?2 END, ?3) \
             ON CONFLICT (job) DO UPDATE SET \
                last_finished_at = excluded.last_finished_at, \
                last_success_at = coalesce(excluded.last_success_at, job_runs.last_success_at), \
                last_error = excluded.last_error",
        )
        .bind(job)
        .bind(at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn job_runs(&self) -> Result<Vec<JobRun>> {
        let rows = sqlx::query(
            "SELECT job, last_started_at, last_finished_at, last_success_at, last_error \
             FROM job_runs ORDER BY job",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(JobRun {
                    job: row.try_get("job")?,
                    last_started_at: row.try_get("last_started_at")?,
                    last_finished_at: row.try_get("last_finished_at")?,
                    last_success_at: row.try_get("last_success_at")?,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect()
    }

    pub async fn job_run(&self, job: &str) -> Result<Option<JobRun>> {
        Ok(self.job_runs().await?.into_iter().find(|r| r.job == job))
    }
}

async fn insert_record_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    new: &NewBackupRecord,
) -> Result<i64> {
    let watermark = new
        .watermark
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = sqlx::query(
        "INSERT INTO backup_records (class, kind, file_name, file_path, size_bytes, created_at, \
         base_backup_id, checksum, watermark, item_count, note) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.class.as_str())
    .bind(new.kind.as_str())
    .bind(&new.file_name)
    .bind(&new.file_path)
    .bind(new.size_bytes)
    .bind(new.created_at)
    .bind(new.base_backup_id)
    .bind(&new.checksum)
    .bind(watermark)
    .bind(new.item_count)
    .bind(&new.note)
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}

fn record_from_row(row: &SqliteRow) -> Result<BackupRecord> {
    let class: String = row.try_get("class")?;
    let kind: String = row.try_get("kind")?;
    let watermark: Option<String> = row.try_get("watermark")?;
    let verify_status: Option<String> = row.try_get("verify_status")?;

    Ok(BackupRecord {
        id: row.try_get("id")?,
        class: class.parse()?,
        kind: kind.parse()?,
        file_name: row.try_get("file_name")?,
        file_path: row.try_get("file_path")?,
        size_bytes: row.try_get("size_bytes")?,
        created_at: row.try_get("created_at")?,
        base_backup_id: row.try_get("base_backup_id")?,
        checksum: row.try_get("checksum")?,
        watermark: watermark
            .as_deref()
            .map(serde_json::from_str::<Watermark>)
            .transpose()?,
        item_count: row.try_get("item_count")?,
        note: row.try_get("note")?,
        verify_status: verify_status.as_deref().and_then(VerifyStatus::parse),
        verified_at: row.try_get("verified_at")?,
    })
}

fn manifest_from_row(row: &SqliteRow) -> Result<ArchiveManifest> {
    Ok(ArchiveManifest {
        record_id: row.try_get("record_id")?,
        archive_file: row.try_get("archive_file")?,
        covered_from: row.try_get("covered_from")?,
        covered_to: row.try_get("covered_to")?,
        first_log_id: row.try_get("first_log_id")?,
        last_log_id: row.try_get("last_log_id")?,
        row_count: row.try_get("row_count")?,
        checksum: row.try_get("checksum")?,
        created_at: row.try_get("created_at")?,
    })
}
