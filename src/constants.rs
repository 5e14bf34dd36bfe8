/// Milliseconds in one day
pub const DAY_MS: i64 = 86_400_000;

/// Timestamp format embedded in artifact file names (UTC, millisecond precision)
pub const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%3f";

/// Suffix of tar.gz artifacts (database and file store backups)
pub const TAR_GZ_SUFFIX: &str = ".tar.gz";

/// Suffix of compressed log archives
pub const LOG_ARCHIVE_SUFFIX: &str = ".json.gz";

/// Suffix used while an artifact is being written
/// Files carrying it are never registered and are removed at startup
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Name of the backup catalog database inside the backup root
pub const CATALOG_FILE_NAME: &str = "catalog.db";

/// Marker file raised while the store runs on a degraded recovery
pub const DEGRADED_MARKER_FILE: &str = "recovery-degraded.json";

/// Mirrored file index inside the file-index directory
pub const FILE_INDEX_FILE_NAME: &str = "index.json";

// =============================================================================
// Artifact entry names
// =============================================================================

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const STORE_ENTRY: &str = "store.db";
pub const STORE_WAL_ENTRY: &str = "store.db-wal";
pub const WAL_SEGMENT_ENTRY: &str = "wal.segment";
pub const FILES_ENTRY_PREFIX: &str = "files/";

// =============================================================================
// SQLite WAL format
// =============================================================================

/// WAL header magic, checksums computed on little-endian words
pub const WAL_MAGIC_LE: u32 = 0x377f_0682;

/// WAL header magic, checksums computed on big-endian words
pub const WAL_MAGIC_BE: u32 = 0x377f_0683;

pub const WAL_HEADER_SIZE: u64 = 32;
pub const WAL_FRAME_HEADER_SIZE: u64 = 24;

// =============================================================================
// Defaults
// =============================================================================

/// Log archives are kept for ten years
pub const DEFAULT_LOG_ARCHIVE_RETENTION_DAYS: i64 = 3650;

/// The live audit-log table keeps ninety days
pub const DEFAULT_LOG_LIVE_RETENTION_DAYS: i64 = 90;

/// Maximum accepted length of an artifact file name
pub const MAX_ARTIFACT_NAME_LEN: usize = 128;

// =============================================================================
// Error Messages
// =============================================================================

pub const ERR_INVALID_FILENAME: &str = "Invalid backup file name";

pub const ERR_OUTSIDE_BACKUP_ROOT: &str = "Resolved path escapes the backup root";

pub const ERR_UNKNOWN_CLASS: &str = "Unknown backup class (expected database, files or logs)";

/// Retention sweeps run once a day
pub const RETENTION_SWEEP_INTERVAL_MS: i64 = DAY_MS;
