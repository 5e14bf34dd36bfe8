//! The append-only audit log, split into two capabilities
//!
//! [`AuditLogWriter`] can only append and read. [`AuditPruneHandle`] is the
//! single way to delete rows: it exists once per process, is owned by the
//! log archiver and only deletes a range whose manifest is already durable.
//! The store itself refuses UPDATE always and DELETE outside a prune grant.

use crate::db::Store;
use crate::error::{AppError, Result};
use crate::models::{ArchiveManifest, AuditLogEntry, NewAuditLogEntry};

const LOG_COLUMNS: &str =
    "id, created_at, user_id, user_name, action, module, target_id, details";

/// Ordinary write access to the audit log
#[derive(Clone)]
pub struct AuditLogWriter {
    store: Store,
}

impl AuditLogWriter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn append(&self, entry: &NewAuditLogEntry) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO system_logs (created_at, user_id, user_name, action, module, \
             target_id, details) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.created_at)
        .bind(&entry.user_id)
        .bind(&entry.user_name)
        .bind(&entry.action)
        .bind(&entry.module)
        .bind(&entry.target_id)
        .bind(&entry.details)
        .execute(&self.store)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn count(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT count(*) FROM system_logs")
            .fetch_one(&self.store)
            .await?;
        Ok(n)
    }

    /// Rows created strictly before `cutoff` (unix ms), in id order
    pub async fn older_than(&self, cutoff: i64) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditLogEntry>(&format!(
            "SELECT {} FROM system_logs WHERE created_at < ? ORDER BY id ASC",
            LOG_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.store)
        .await?;
        Ok(rows)
    }

    pub async fn count_between(&self, from: i64, to: i64) -> Result<i64> {
        let n = sqlx::query_scalar(
            "SELECT count(*) FROM system_logs WHERE created_at >= ? AND created_at <= ?",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.store)
        .await?;
        Ok(n)
    }
}

/// Archiver-only capability to remove archived rows
///
/// Deliberately not `Clone`.
pub struct AuditPruneHandle {
    store: Store,
}

impl AuditPruneHandle {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Delete exactly the rows described by `manifest`
    ///
    /// Runs in one transaction: grant, delete the id range inside the covered
    /// window, revoke. When the number of deleted rows differs from the
    /// manifest's row count the transaction is rolled back and nothing is
    /// removed.
    pub async fn prune_archived(&self, manifest: &ArchiveManifest) -> Result<u64> {
        let grant = grant_token(manifest);
        let mut tx = self.store.begin().await?;

        sqlx::query("INSERT INTO audit_prune_grants (token, granted_at) VALUES (?, ?)")
            .bind(&grant)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query(
            "DELETE FROM system_logs WHERE id >= ? AND id <= ? \
             AND created_at >= ? AND created_at <= ?",
        )
        .bind(manifest.first_log_id)
        .bind(manifest.last_log_id)
        .bind(manifest.covered_from)
        .bind(manifest.covered_to)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if deleted as i64 != manifest.row_count {
            tx.rollback().await?;
            tracing::error!(
                "Refusing to prune {}: manifest has {} rows, delete matched {}",
                manifest.archive_file,
                manifest.row_count,
                deleted
            );
            return Err(AppError::ArchiveCountMismatch {
                expected: manifest.row_count,
                actual: deleted as i64,
            });
        }

        sqlx::query("DELETE FROM audit_prune_grants WHERE token = ?")
            .bind(&grant)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(deleted)
    }
}

/// Grant token naming the archive being pruned
fn grant_token(manifest: &ArchiveManifest) -> String {
    format!(
        "{}:{}",
        manifest.archive_file,
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_store_pool, init_store_schema, store_options};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = create_store_pool(store_options(&dir.path().join("app.db")));
        init_store_schema(&store).await.unwrap();
        (dir, store)
    }

    fn manifest(first: i64, last: i64, rows: i64) -> ArchiveManifest {
        ArchiveManifest {
            record_id: 1,
            archive_file: "logs_1970-01-01_1-3.json.gz".to_string(),
            covered_from: 0,
            covered_to: 1_000,
            first_log_id: first,
            last_log_id: last,
            row_count: rows,
            checksum: String::new(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_update_and_plain_delete_are_refused() {
        let (_dir, store) = setup().await;
        let writer = AuditLogWriter::new(store.clone());
        writer
            .append(&NewAuditLogEntry::new("login", "auth", 10))
            .await
            .unwrap();

        assert!(sqlx::query("UPDATE system_logs SET action = 'x'")
            .execute(&store)
            .await
            .is_err());
        assert!(sqlx::query("DELETE FROM system_logs").execute(&store).await.is_err());
        assert_eq!(writer.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune_deletes_manifest_range_and_revokes_grant() {
        let (_dir, store) = setup().await;
        let writer = AuditLogWriter::new(store.clone());
        for ts in [10, 20, 30] {
            writer
                .append(&NewAuditLogEntry::new("view", "hazards", ts))
                .await
                .unwrap();
        }

        let pruner = AuditPruneHandle::new(store.clone());
        assert_eq!(pruner.prune_archived(&manifest(1, 3, 3)).await.unwrap(), 3);
        assert_eq!(writer.count().await.unwrap(), 0);

        let grants: i64 = sqlx::query_scalar("SELECT count(*) FROM audit_prune_grants")
            .fetch_one(&store)
            .await
            .unwrap();
        assert_eq!(grants, 0);
    }

    #[tokio::test]
    async fn test_prune_count_mismatch_rolls_back() {
        let (_dir, store) = setup().await;
        let writer = AuditLogWriter::new(store.clone());
        for ts in [10, 20] {
            writer
                .append(&NewAuditLogEntry::new("view", "hazards", ts))
                .await
                .unwrap();
        }

        let pruner = AuditPruneHandle::new(store.clone());
        let err = pruner.prune_archived(&manifest(1, 2, 5)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::ArchiveCountMismatch { expected: 5, actual: 2 }
        ));
        assert_eq!(writer.count().await.unwrap(), 2);
    }
}
