pub mod database;
pub mod files;
pub mod retention;

pub use database::DatabaseBackupEngine;
pub use files::FileStoreBackupEngine;
pub use retention::{RetentionPolicy, RetentionReport};

/// Current time as unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
