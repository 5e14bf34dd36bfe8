pub mod download;
pub mod health;
pub mod protection;
pub mod validation;

pub use download::download_backup;
pub use health::health_check;
pub use protection::{
    acknowledge_degraded, backup_status, delete_backup, list_backups, manual_backup,
    retention_sweep, trigger_backup, verify_backup,
};
pub use validation::{format_bytes, timestamp_to_rfc3339};
