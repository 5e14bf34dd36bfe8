pub mod pool;
pub mod tables;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{ConnectOptions, Connection, Row};
use std::path::Path;

use crate::error::{AppError, Result};

pub use pool::{create_catalog_pool, create_store_pool, store_options};

/// Primary store handle
pub type Store = SqlitePool;

/// Create every table, index and trigger of the store that is missing
pub async fn init_store_schema(store: &Store) -> Result<()> {
    for statement in tables::STORE_SCHEMA {
        sqlx::query(statement).execute(store).await?;
    }
    Ok(())
}

pub async fn init_catalog_schema(catalog: &SqlitePool) -> Result<()> {
    for statement in tables::CATALOG_SCHEMA {
        sqlx::query(statement).execute(catalog).await?;
    }
    Ok(())
}

/// Current journal mode of the store, lower-cased
pub async fn journal_mode(store: &Store) -> Result<String> {
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(store)
        .await?;
    Ok(mode.to_lowercase())
}

/// Result of opening a store file and checking it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeReport {
    pub tables: i64,
    pub departments: i64,
    pub users: i64,
}

/// Open the store file at `path` without creating it and make sure it is usable
///
/// Runs `quick_check`, then counts schema objects and core rows. A missing
/// file, a failed check or an empty schema all count as unusable.
pub async fn smoke_test(path: &Path) -> Result<SmokeReport> {
    if !path.exists() {
        return Err(AppError::StoreUnavailable(format!("{} does not exist", path.display())));
    }

    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .connect()
        .await
        .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;

    let check: String = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_one(&mut conn)
        .await
        .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
    if check != "ok" {
        let _ = conn.close().await;
        return Err(AppError::IntegrityFailure(format!("quick_check: {}", check)));
    }

    let tables: i64 =
        sqlx::query_scalar("SELECT count(*) FROM sqlite_master WHERE type = 'table'")
            .fetch_one(&mut conn)
            .await?;
    if tables == 0 {
        let _ = conn.close().await;
        return Err(AppError::StoreUnavailable("store has no tables".to_string()));
    }

    let departments = count_if_present(&mut conn, "departments").await?;
    let users = count_if_present(&mut conn, "users").await?;
    conn.close().await?;

    Ok(SmokeReport {
        tables,
        departments,
        users,
    })
}

async fn count_if_present(conn: &mut sqlx::SqliteConnection, table: &str) -> Result<i64> {
    let present = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
    if present.is_none() {
        return Ok(0);
    }
    let row = sqlx::query(&format!("SELECT count(*) AS n FROM {}", table))
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("n")?)
}
