//! FileMetadataIndex: the store table describing every stored upload
//!
//! The upload write path keeps it current through [`FileMetadataIndex::upsert`]
//! and [`FileMetadataIndex::remove`]; the backup engines only read it.

use crate::db::Store;
use crate::error::{AppError, Result};
use crate::models::FileMetadataEntry;

const ENTRY_COLUMNS: &str =
    "file_path, file_name, file_type, file_size, md5_hash, category, uploader_id, uploaded_at";

#[derive(Clone)]
pub struct FileMetadataIndex {
    store: Store,
}

impl FileMetadataIndex {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record a written file, replacing the previous entry for the same path
    pub async fn upsert(&self, entry: &FileMetadataEntry) -> Result<()> {
        if !FileMetadataEntry::validate_path(&entry.file_path) {
            return Err(AppError::InvalidInput(format!(
                "Invalid file path: {}",
                entry.file_path
            )));
        }

        sqlx::query(
            "INSERT INTO file_metadata (file_path, file_name, file_type, file_size, md5_hash, \
             category, uploader_id, uploaded_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (file_path) DO UPDATE SET \
                file_name = excluded.file_name, \
                file_type = excluded.file_type, \
                file_size = excluded.file_size, \
                md5_hash = excluded.md5_hash, \
                category = excluded.category, \
                uploader_id = excluded.uploader_id, \
                uploaded_at = excluded.uploaded_at",
        )
        .bind(&entry.file_path)
        .bind(&entry.file_name)
        .bind(&entry.file_type)
        .bind(entry.file_size)
        .bind(&entry.md5_hash)
        .bind(&entry.category)
        .bind(&entry.uploader_id)
        .bind(entry.uploaded_at)
        .execute(&self.store)
        .await?;
        Ok(())
    }

    /// Forget a deleted file; returns whether an entry existed
    pub async fn remove(&self, file_path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_metadata WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.store)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, file_path: &str) -> Result<Option<FileMetadataEntry>> {
        let entry = sqlx::query_as::<_, FileMetadataEntry>(&format!(
            "SELECT {} FROM file_metadata WHERE file_path = ?",
            ENTRY_COLUMNS
        ))
        .bind(file_path)
        .fetch_optional(&self.store)
        .await?;
        Ok(entry)
    }

    /// Every entry, oldest upload first
    pub async fn all(&self) -> Result<Vec<FileMetadataEntry>> {
        let entries = sqlx::query_as::<_, FileMetadataEntry>(&format!(
            "SELECT {} FROM file_metadata ORDER BY uploaded_at ASC, file_path ASC",
            ENTRY_COLUMNS
        ))
        .fetch_all(&self.store)
        .await?;
        Ok(entries)
    }

    /// Entries written at or after `watermark` (unix ms)
    ///
    /// Inclusive, so a write stamped in the watermark's millisecond is never
    /// lost; callers drop entries they already hold.
    pub async fn changed_since(&self, watermark: i64) -> Result<Vec<FileMetadataEntry>> {
        let entries = sqlx::query_as::<_, FileMetadataEntry>(&format!(
            "SELECT {} FROM file_metadata WHERE uploaded_at >= ? \
             ORDER BY uploaded_at ASC, file_path ASC",
            ENTRY_COLUMNS
        ))
        .bind(watermark)
        .fetch_all(&self.store)
        .await?;
        Ok(entries)
    }

    pub async fn paths(&self) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar("SELECT file_path FROM file_metadata ORDER BY file_path")
            .fetch_all(&self.store)
            .await?;
        Ok(paths)
    }

    pub async fn count(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT count(*) FROM file_metadata")
            .fetch_one(&self.store)
            .await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_store_pool, init_store_schema, store_options};
    use tempfile::TempDir;

    fn entry(path: &str, uploaded_at: i64) -> FileMetadataEntry {
        FileMetadataEntry {
            file_path: path.to_string(),
            file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            file_type: "application/pdf".to_string(),
            file_size: 3,
            md5_hash: "900150983cd24fb0d6963f7d28e17f72".to_string(),
            category: "documents".to_string(),
            uploader_id: Some("u1".to_string()),
            uploaded_at,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_changed_since() {
        let dir = TempDir::new().unwrap();
        let store = create_store_pool(store_options(&dir.path().join("app.db")));
        init_store_schema(&store).await.unwrap();
        let index = FileMetadataIndex::new(store);

        index.upsert(&entry("docs/a.pdf", 100)).await.unwrap();
        index.upsert(&entry("docs/b.pdf", 200)).await.unwrap();
        index.upsert(&entry("docs/a.pdf", 300)).await.unwrap();

        assert_eq!(index.count().await.unwrap(), 2);
        let changed = index.changed_since(150).await.unwrap();
        let paths: Vec<_> = changed.iter().map(|e| e.file_path.as_str()).collect();
        assert_eq!(paths, vec!["docs/b.pdf", "docs/a.pdf"]);

        // The watermark's own millisecond is included
        let changed = index.changed_since(300).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].file_path, "docs/a.pdf");

        assert!(index.remove("docs/b.pdf").await.unwrap());
        assert!(!index.remove("docs/b.pdf").await.unwrap());
        assert_eq!(index.paths().await.unwrap(), vec!["docs/a.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_upsert_rejects_escaping_path() {
        let dir = TempDir::new().unwrap();
        let store = create_store_pool(store_options(&dir.path().join("app.db")));
        init_store_schema(&store).await.unwrap();
        let index = FileMetadataIndex::new(store);

        assert!(matches!(
            index.upsert(&entry("../etc/passwd", 1)).await,
            Err(AppError::InvalidInput(_))
        ));
    }
}
