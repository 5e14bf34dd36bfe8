use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

/// Connection options of the primary store
///
/// Automatic checkpoints are off: only the database backup engine folds the
/// WAL back into the main file, so every committed frame between two backups
/// stays in the WAL where an incremental can copy it.
pub fn store_options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true)
        .pragma("wal_autocheckpoint", "0")
}

/// Lazily connected store pool
///
/// Nothing touches the file until the first query, so recovery can run
/// against the path before the application opens it. Connections are never
/// recycled: closing the last one would checkpoint the WAL behind the backup
/// engine's back.
pub fn create_store_pool(options: SqliteConnectOptions) -> SqlitePool {
    tracing::info!("Creating store connection pool...");

    SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_lazy_with(options)
}

/// Create the backup catalog pool, creating the file on first run
pub async fn create_catalog_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    tracing::info!("Opening backup catalog at: {:?}", path);

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    tracing::info!("Backup catalog opened successfully");

    Ok(pool)
}
