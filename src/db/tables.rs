//! Schema of the primary store (the part this subsystem reads and guards)
//! and of the backup catalog.

// =============================================================================
// Primary store
// =============================================================================

pub const CREATE_DEPARTMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS departments (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    parent_id   TEXT,
    manager_id  TEXT,
    level       INTEGER NOT NULL DEFAULT 1
)"#;

pub const CREATE_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id             TEXT PRIMARY KEY,
    username       TEXT NOT NULL UNIQUE,
    name           TEXT NOT NULL,
    password       TEXT NOT NULL,
    role           TEXT NOT NULL DEFAULT 'user',
    department_id  TEXT,
    job_title      TEXT,
    is_active      INTEGER NOT NULL DEFAULT 1
)"#;

/// One row per stored upload, maintained by the upload write path
pub const CREATE_FILE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS file_metadata (
    file_path    TEXT PRIMARY KEY,
    file_name    TEXT NOT NULL,
    file_type    TEXT NOT NULL,
    file_size    INTEGER NOT NULL,
    md5_hash     TEXT NOT NULL,
    category     TEXT NOT NULL,
    uploader_id  TEXT,
    uploaded_at  INTEGER NOT NULL
)"#;

pub const CREATE_FILE_METADATA_UPLOADED_AT_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_file_metadata_uploaded_at ON file_metadata (uploaded_at)";

pub const CREATE_SYSTEM_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS system_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at  INTEGER NOT NULL,
    user_id     TEXT,
    user_name   TEXT,
    action      TEXT NOT NULL,
    module      TEXT NOT NULL,
    target_id   TEXT,
    details     TEXT
)"#;

pub const CREATE_SYSTEM_LOGS_CREATED_AT_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_system_logs_created_at ON system_logs (created_at)";

/// A row here, visible only inside the archiver's own transaction, is what
/// lets a delete on system_logs through
pub const CREATE_AUDIT_PRUNE_GRANTS: &str = r#"
CREATE TABLE IF NOT EXISTS audit_prune_grants (
    token       TEXT PRIMARY KEY,
    granted_at  INTEGER NOT NULL
)"#;

pub const CREATE_SYSTEM_LOGS_NO_UPDATE: &str = r#"
CREATE TRIGGER IF NOT EXISTS system_logs_no_update
BEFORE UPDATE ON system_logs
BEGIN
    SELECT RAISE(ABORT, 'system_logs is append-only');
END"#;

pub const CREATE_SYSTEM_LOGS_GUARDED_DELETE: &str = r#"
CREATE TRIGGER IF NOT EXISTS system_logs_guarded_delete
BEFORE DELETE ON system_logs
WHEN NOT EXISTS (SELECT 1 FROM audit_prune_grants)
BEGIN
    SELECT RAISE(ABORT, 'system_logs rows are removed only by the log archiver');
END"#;

pub const STORE_SCHEMA: &[&str] = &[
    CREATE_DEPARTMENTS,
    CREATE_USERS,
    CREATE_FILE_METADATA,
    CREATE_FILE_METADATA_UPLOADED_AT_IDX,
    CREATE_SYSTEM_LOGS,
    CREATE_SYSTEM_LOGS_CREATED_AT_IDX,
    CREATE_AUDIT_PRUNE_GRANTS,
    CREATE_SYSTEM_LOGS_NO_UPDATE,
    CREATE_SYSTEM_LOGS_GUARDED_DELETE,
];

// =============================================================================
// Backup catalog
// =============================================================================

pub const CREATE_BACKUP_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS backup_records (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    class           TEXT NOT NULL,
    kind            TEXT NOT NULL,
    file_name       TEXT NOT NULL UNIQUE,
    file_path       TEXT NOT NULL,
    size_bytes      INTEGER NOT NULL,
    created_at      INTEGER NOT NULL,
    base_backup_id  INTEGER REFERENCES backup_records (id),
    checksum        TEXT NOT NULL,
    watermark       TEXT,
    item_count      INTEGER NOT NULL DEFAULT 0,
    note            TEXT,
    verify_status   TEXT,
    verified_at     INTEGER
)"#;

pub const CREATE_BACKUP_RECORDS_CLASS_IDX: &str =
    "CREATE INDEX IF NOT EXISTS idx_backup_records_class ON backup_records (class, created_at)";

pub const CREATE_ARCHIVE_MANIFESTS: &str = r#"
CREATE TABLE IF NOT EXISTS archive_manifests (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id     INTEGER NOT NULL REFERENCES backup_records (id) ON DELETE CASCADE,
    archive_file  TEXT NOT NULL UNIQUE,
    covered_from  INTEGER NOT NULL,
    covered_to    INTEGER NOT NULL,
    first_log_id  INTEGER NOT NULL,
    last_log_id   INTEGER NOT NULL,
    row_count     INTEGER NOT NULL,
    checksum      TEXT NOT NULL,
    created_at    INTEGER NOT NULL
)"#;

/// Last start/finish/success of scheduled jobs that leave no backup record
pub const CREATE_JOB_RUNS: &str = r#"
CREATE TABLE IF NOT EXISTS job_runs (
    job               TEXT PRIMARY KEY,
    last_started_at   INTEGER,
    last_finished_at  INTEGER,
    last_success_at   INTEGER,
    last_error        TEXT
)"#;

pub const CATALOG_SCHEMA: &[&str] = &[
    CREATE_BACKUP_RECORDS,
    CREATE_BACKUP_RECORDS_CLASS_IDX,
    CREATE_ARCHIVE_MANIFESTS,
    CREATE_JOB_RUNS,
];
