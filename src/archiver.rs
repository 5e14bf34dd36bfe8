//! LogArchiver: moves aged audit-log rows into compressed daily archives
//!
//! For each UTC day: write the archive, register record and manifest in one
//! catalog transaction, and only then delete the exported rows through the
//! prune handle, which checks the deleted count against the manifest.

use chrono::{TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::artifact::{self, PartialFile, WrittenArtifact};
use crate::audit_log::{AuditLogWriter, AuditPruneHandle};
use crate::backup::{now_ms, retention};
use crate::catalog::Catalog;
use crate::constants::DAY_MS;
use crate::error::Result;
use crate::models::{
    ArchiveManifest, AuditLogEntry, BackupClass, BackupKind, BackupRecord, BackupStats,
    NewBackupRecord, Watermark,
};
use crate::security::sha256_file;

/// What one archiving pass did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRun {
    pub archives: Vec<ArchiveManifest>,
    pub rows_archived: i64,
    pub rows_deleted: u64,
}

pub struct LogArchiver {
    writer: AuditLogWriter,
    pruner: AuditPruneHandle,
    catalog: Catalog,
    backup_root: PathBuf,
}

impl LogArchiver {
    pub fn new(
        writer: AuditLogWriter,
        pruner: AuditPruneHandle,
        catalog: Catalog,
        backup_root: PathBuf,
    ) -> Self {
        Self {
            writer,
            pruner,
            catalog,
            backup_root,
        }
    }

    /// Archive then delete every live row older than `cutoff_days`
    ///
    /// Stops at the first day whose deletion does not match its manifest;
    /// days archived before that stay archived and pruned.
    pub async fn archive_older_than(&self, cutoff_days: i64) -> Result<ArchiveRun> {
        let cutoff = now_ms() - cutoff_days.saturating_mul(DAY_MS);
        let rows = self.writer.older_than(cutoff).await?;
        let mut run = ArchiveRun::default();
        if rows.is_empty() {
            tracing::debug!("No audit-log rows older than {} day(s)", cutoff_days);
            return Ok(run);
        }

        for (day, batch) in group_by_day(rows) {
            let (record, manifest) = self.write_day(&day, batch).await?;
            let deleted = self.pruner.prune_archived(&manifest).await?;

            tracing::info!(
                "Archived {} audit-log row(s) of {} into {}",
                manifest.row_count,
                day,
                record.file_name
            );
            run.rows_archived += manifest.row_count;
            run.rows_deleted += deleted;
            run.archives.push(manifest);
        }
        Ok(run)
    }

    /// Scheduled trigger keeping the live table within `max_age_days`
    pub async fn prune_live_table(&self, max_age_days: i64) -> Result<ArchiveRun> {
        self.archive_older_than(max_age_days).await
    }

    /// Delete archives whose content ends more than `max_age_days` ago
    pub async fn prune_archives(&self, max_age_days: i64) -> Result<Vec<String>> {
        let cutoff = now_ms() - max_age_days.saturating_mul(DAY_MS);
        let expired = self.catalog.manifests_covered_before(cutoff).await?;

        let mut removed = Vec::with_capacity(expired.len());
        for manifest in expired {
            let record =
                retention::delete_backup(&self.catalog, &self.backup_root, manifest.record_id)
                    .await?;
            removed.push(record.file_name);
        }
        if !removed.is_empty() {
            tracing::info!("Pruned {} expired log archive(s)", removed.len());
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<BackupStats> {
        self.catalog.stats(BackupClass::Logs).await
    }

    async fn write_day(
        &self,
        day: &str,
        batch: Vec<AuditLogEntry>,
    ) -> Result<(BackupRecord, ArchiveManifest)> {
        let first_id = batch.iter().map(|r| r.id).min().unwrap_or(0);
        let last_id = batch.iter().map(|r| r.id).max().unwrap_or(0);
        let covered_from = batch.iter().map(|r| r.created_at).min().unwrap_or(0);
        let covered_to = batch.iter().map(|r| r.created_at).max().unwrap_or(0);
        let row_count = batch.len() as i64;

        if let Some(existing) = self
            .catalog
            .find_manifest(first_id, last_id, covered_from, covered_to, row_count)
            .await?
        {
            let record = self.catalog.get(existing.record_id).await?;
            let path = self.backup_root.join(&record.file_path);
            if sha256_file(&path).ok().as_deref() == Some(existing.checksum.as_str()) {
                tracing::info!(
                    "Rows of {} already archived in {}, pruning against it",
                    day,
                    record.file_name
                );
                return Ok((record, existing));
            }
            tracing::warn!("Archive {} is not intact, writing a new one", record.file_name);
        }

        let created_at = now_ms();

        let file_name = self.unique_name(day, first_id, last_id);
        let backup_root = self.backup_root.clone();
        let name = file_name.clone();
        let written = tokio::task::spawn_blocking(move || write_archive(&backup_root, &name, &batch))
            .await??;

        let new = NewBackupRecord {
            class: BackupClass::Logs,
            kind: BackupKind::Full,
            file_name: written.file_name.clone(),
            file_path: written.rel_path.clone(),
            size_bytes: written.size_bytes,
            created_at,
            base_backup_id: None,
            checksum: written.checksum.clone(),
            watermark: Some(Watermark::Logs {
                covered_from,
                covered_to,
            }),
            item_count: row_count,
            note: None,
        };
        match self
            .catalog
            .insert_log_archive(&new, first_id, last_id, covered_from, covered_to)
            .await
        {
            Ok(pair) => Ok(pair),
            Err(e) => {
                written.discard();
                Err(e)
            }
        }
    }

    /// A different batch for a day that already has an archive gets a
    /// numbered name
    fn unique_name(&self, day: &str, first_id: i64, last_id: i64) -> String {
        let dir = self
            .backup_root
            .join(artifact::relative_dir(BackupClass::Logs, BackupKind::Full));
        let base = artifact::log_archive_name(day, first_id, last_id);
        if !dir.join(&base).exists() {
            return base;
        }
        (1..)
            .map(|n| artifact::log_archive_name(&format!("{}_r{}", day, n), first_id, last_id))
            .find(|name| !dir.join(name).exists())
            .unwrap_or(base)
    }
}

fn day_of(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

fn group_by_day(rows: Vec<AuditLogEntry>) -> BTreeMap<String, Vec<AuditLogEntry>> {
    let mut days: BTreeMap<String, Vec<AuditLogEntry>> = BTreeMap::new();
    for row in rows {
        days.entry(day_of(row.created_at)).or_default().push(row);
    }
    days
}

fn write_archive(backup_root: &Path, file_name: &str, rows: &[AuditLogEntry]) -> Result<WrittenArtifact> {
    let rel_dir = artifact::relative_dir(BackupClass::Logs, BackupKind::Full);
    let (partial, file) = PartialFile::create(backup_root, rel_dir, file_name)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    serde_json::to_writer(&mut encoder, rows)?;
    let mut file = encoder.finish()?;
    file.flush()?;
    Ok(partial.commit(file)?)
}

/// Decompress an archive back into its rows
pub fn read_archive(path: &Path) -> Result<Vec<AuditLogEntry>> {
    let file = std::fs::File::open(path)?;
    let decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
    Ok(serde_json::from_reader(decoder)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, created_at: i64) -> AuditLogEntry {
        AuditLogEntry {
            id,
            created_at,
            user_id: None,
            user_name: None,
            action: "view".to_string(),
            module: "permits".to_string(),
            target_id: None,
            details: None,
        }
    }

    #[test]
    fn test_group_by_utc_day() {
        let day = DAY_MS;
        let rows = vec![row(1, 10), row(2, day - 1), row(3, day), row(4, 2 * day + 5)];
        let groups = group_by_day(rows);

        let keys: Vec<_> = groups.keys().cloned().collect();
        assert_eq!(keys, vec!["1970-01-01", "1970-01-02", "1970-01-03"]);
        assert_eq!(groups["1970-01-01"].len(), 2);
    }

    #[tokio::test]
    async fn test_unpruned_archive_is_reused_not_duplicated() {
        use crate::db::{create_store_pool, init_store_schema, store_options};
        use crate::models::NewAuditLogEntry;

        let dir = tempfile::TempDir::new().unwrap();
        let store = create_store_pool(store_options(&dir.path().join("app.db")));
        init_store_schema(&store).await.unwrap();
        let backup_root = dir.path().join("backups");
        let catalog = Catalog::open(&backup_root).await.unwrap();
        let writer = AuditLogWriter::new(store.clone());
        let archiver = LogArchiver::new(
            writer.clone(),
            AuditPruneHandle::new(store.clone()),
            catalog.clone(),
            backup_root.clone(),
        );

        let old = (now_ms() - 200 * DAY_MS) / DAY_MS * DAY_MS + 1_000;
        for i in 0..20 {
            writer
                .append(&NewAuditLogEntry::new("view", "permits", old + i))
                .await
                .unwrap();
        }

        // Archive written and registered, rows never pruned
        let rows = writer.older_than(old + DAY_MS).await.unwrap();
        let (first, _) = group_by_day(rows).into_iter().next().unwrap();
        let batch = writer.older_than(old + DAY_MS).await.unwrap();
        let (record, _) = archiver.write_day(&first, batch).await.unwrap();
        assert_eq!(writer.count().await.unwrap(), 20);

        let run = archiver.archive_older_than(90).await.unwrap();
        assert_eq!(run.rows_deleted, 20);
        assert_eq!(run.archives[0].record_id, record.id);
        assert_eq!(writer.count().await.unwrap(), 0);

        let archives = catalog.list(Some(BackupClass::Logs)).await.unwrap();
        assert_eq!(archives.len(), 1);
        let files = std::fs::read_dir(backup_root.join("logs/archives")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn test_archive_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let rows = vec![row(1, 10), row(2, 20)];
        let written = write_archive(dir.path(), "logs_1970-01-01_1-2.json.gz", &rows).unwrap();

        assert_eq!(written.rel_path, "logs/archives/logs_1970-01-01_1-2.json.gz");
        assert_eq!(read_archive(&written.abs_path).unwrap(), rows);
    }
}
