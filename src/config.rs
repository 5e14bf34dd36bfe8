use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backup::retention::RetentionPolicy;
use crate::constants::{DEFAULT_LOG_ARCHIVE_RETENTION_DAYS, DEFAULT_LOG_LIVE_RETENTION_DAYS};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub environment: String,
    pub allowed_origins: Vec<String>,
    /// Primary relational store (single SQLite file in WAL mode)
    pub database_path: PathBuf,
    /// Root of the binary upload tree
    pub uploads_dir: PathBuf,
    /// Root of every backup artifact and of the backup catalog
    pub backup_root: PathBuf,
    /// Mirror of the file index used for incremental diffing
    pub file_index_dir: PathBuf,
    /// Plain export of departments/users used for degraded recovery
    pub core_export_dir: PathBuf,
    pub db_full_interval: Duration,
    pub db_incremental_interval: Duration,
    pub files_full_interval: Duration,
    pub files_incremental_interval: Duration,
    pub log_archive_interval: Duration,
    pub log_live_retention_days: i64,
    pub log_archive_retention_days: i64,
    pub retention_max_age_days: i64,
    pub retention_min_keep: usize,
    pub checkpoint_timeout: Duration,
    pub scheduler_tick: Duration,
    pub scheduler_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if it exists (development)
        dotenvy::dotenv().ok();

        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = parse_var("SERVER_PORT", 8080u16)?;
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let database_path = path_var("DATABASE_PATH", "./data/app.db");
        let uploads_dir = path_var("UPLOADS_DIR", "./public/uploads");
        let backup_root = path_var("BACKUP_ROOT", "./data/backups");
        let file_index_dir = path_var("FILE_INDEX_DIR", "./data/file-index");
        let core_export_dir = path_var("CORE_EXPORT_DIR", "./data/core_data");

        let db_full_interval = hours(parse_var("DB_FULL_INTERVAL_HOURS", 24u64)?);
        let db_incremental_interval =
            minutes(parse_var("DB_INCREMENTAL_INTERVAL_MINUTES", 60u64)?);
        let files_full_interval = hours(parse_var("FILES_FULL_INTERVAL_HOURS", 24u64)?);
        let files_incremental_interval =
            minutes(parse_var("FILES_INCREMENTAL_INTERVAL_MINUTES", 60u64)?);
        let log_archive_interval = hours(parse_var("LOG_ARCHIVE_INTERVAL_DAYS", 15u64)? * 24);

        let log_live_retention_days =
            parse_var("LOG_LIVE_RETENTION_DAYS", DEFAULT_LOG_LIVE_RETENTION_DAYS)?;
        let log_archive_retention_days =
            parse_var("LOG_ARCHIVE_RETENTION_DAYS", DEFAULT_LOG_ARCHIVE_RETENTION_DAYS)?;
        let retention_max_age_days = parse_var("RETENTION_MAX_AGE_DAYS", 30i64)?;
        let retention_min_keep = parse_var("RETENTION_MIN_KEEP", 3usize)?;

        let checkpoint_timeout = Duration::from_secs(parse_var("CHECKPOINT_TIMEOUT_SECS", 10u64)?);
        let scheduler_tick = Duration::from_secs(parse_var("SCHEDULER_TICK_SECS", 60u64)?);
        let scheduler_enabled = parse_var("SCHEDULER_ENABLED", true)?;

        if log_live_retention_days <= 0 || retention_max_age_days < 0 {
            return Err("Retention horizons must be positive".to_string());
        }

        Ok(Config {
            server_host,
            server_port,
            environment,
            allowed_origins,
            database_path,
            uploads_dir,
            backup_root,
            file_index_dir,
            core_export_dir,
            db_full_interval,
            db_incremental_interval,
            files_full_interval,
            files_incremental_interval,
            log_archive_interval,
            log_live_retention_days,
            log_archive_retention_days,
            retention_max_age_days,
            retention_min_keep,
            checkpoint_timeout,
            scheduler_tick,
            scheduler_enabled,
        })
    }

    /// Get server address as string
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Retention policy applied to the database and files classes
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days: self.retention_max_age_days,
            min_keep_count: self.retention_min_keep,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn path_var(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env::var(name).unwrap_or_else(|_| default.to_string()))
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h * 3600)
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}
