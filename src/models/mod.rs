pub mod audit;
pub mod backup;
pub mod core_export;
pub mod file_meta;

pub use audit::{ArchiveManifest, AuditLogEntry, NewAuditLogEntry};
pub use backup::{
    BackupClass, BackupKind, BackupRecord, BackupRun, BackupStats, KindStats, NewBackupRecord,
    RunOutcome, RunStatus, VerifyStatus, WalPosition, Watermark,
};
pub use core_export::{CoreUser, Department};
pub use file_meta::FileMetadataEntry;
