//! FileStoreBackupEngine: full and incremental archives of the upload tree
//!
//! What to copy comes from the FileMetadataIndex, never from walking the
//! upload directory. Deletions are detected against a mirror of the chain's
//! file list kept in the file-index directory.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::now_ms;
use crate::artifact::{self, PartialFile, TarGzWriter, WrittenArtifact};
use crate::catalog::Catalog;
use crate::constants::{FILES_ENTRY_PREFIX, FILE_INDEX_FILE_NAME, MANIFEST_ENTRY};
use crate::error::{AppError, Result};
use crate::file_index::FileMetadataIndex;
use crate::models::{
    BackupClass, BackupKind, BackupRecord, BackupRun, BackupStats, FileMetadataEntry,
    NewBackupRecord, Watermark,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub path: String,
    pub size: i64,
    pub md5: String,
    pub uploaded_at: i64,
}

impl From<&FileMetadataEntry> for ManifestEntry {
    fn from(e: &FileMetadataEntry) -> Self {
        Self {
            path: e.file_path.clone(),
            size: e.file_size,
            md5: e.md5_hash.clone(),
            uploaded_at: e.uploaded_at,
        }
    }
}

/// `manifest.json` of a files artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesManifest {
    pub kind: BackupKind,
    pub created_at: i64,
    pub base_backup_id: Option<i64>,
    pub previous_backup_id: Option<i64>,
    /// Highest `uploadedAt` covered once this artifact is applied
    pub watermark: Option<i64>,
    pub entries: Vec<ManifestEntry>,
    /// Paths removed from the index since the previous backup
    pub tombstones: Vec<String>,
    pub warnings: Vec<String>,
}

/// File list of the current chain as of its newest record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainMirror {
    backup_id: i64,
    full_id: i64,
    files: BTreeMap<String, ManifestEntry>,
}

impl ChainMirror {
    fn apply(&mut self, manifest: &FilesManifest) {
        for entry in &manifest.entries {
            self.files.insert(entry.path.clone(), entry.clone());
        }
        for path in &manifest.tombstones {
            self.files.remove(path);
        }
    }
}

/// Outcome of rebuilding the upload tree from the newest files chain
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesRestoreReport {
    pub full_backup_id: i64,
    pub incrementals_applied: usize,
    pub files_restored: usize,
    pub files_removed: usize,
}

#[derive(Clone)]
pub struct FileStoreBackupEngine {
    index: FileMetadataIndex,
    uploads_dir: PathBuf,
    backup_root: PathBuf,
    file_index_dir: PathBuf,
    catalog: Catalog,
}

impl FileStoreBackupEngine {
    pub fn new(
        index: FileMetadataIndex,
        uploads_dir: PathBuf,
        backup_root: PathBuf,
        file_index_dir: PathBuf,
        catalog: Catalog,
    ) -> Self {
        Self {
            index,
            uploads_dir,
            backup_root,
            file_index_dir,
            catalog,
        }
    }

    pub async fn run_full_backup(&self) -> Result<BackupRun> {
        let entries = self.index.all().await?;
        let (created_at, file_name) = artifact::unique_tar_artifact(
            &self.backup_root,
            BackupClass::Files,
            BackupKind::Full,
            now_ms(),
        );
        let watermark = entries.iter().map(|e| e.uploaded_at).max();
        let manifest = FilesManifest {
            kind: BackupKind::Full,
            created_at,
            base_backup_id: None,
            previous_backup_id: None,
            watermark,
            entries: Vec::new(),
            tombstones: Vec::new(),
            warnings: Vec::new(),
        };

        let (written, manifest) = self.write_artifact(file_name, entries, manifest).await?;
        let record = self
            .register(&written, &manifest, BackupKind::Full, None)
            .await?;

        let mut mirror = ChainMirror {
            backup_id: record.id,
            full_id: record.id,
            files: BTreeMap::new(),
        };
        mirror.apply(&manifest);
        self.save_mirror(&mirror).await?;

        tracing::info!(
            "Files full backup {} written ({} files, {} warnings)",
            record.file_name,
            manifest.entries.len(),
            manifest.warnings.len()
        );
        Ok(BackupRun {
            record: Some(record),
            warnings: manifest.warnings,
            ..Default::default()
        })
    }

    pub async fn run_incremental_backup(&self) -> Result<BackupRun> {
        let Some((full, chain)) = self.catalog.latest_chain(BackupClass::Files).await? else {
            return self
                .fall_back_to_full("no full files backup to base an incremental on")
                .await;
        };
        let previous: &BackupRecord = chain.last().unwrap_or(&full);

        let mut mirror = match self.load_mirror(&full, &chain).await {
            Ok(mirror) => mirror,
            Err(reason) => return self.fall_back_to_full(&reason).await,
        };

        let since = previous.upload_watermark();
        let changed: Vec<FileMetadataEntry> = match since {
            Some(watermark) => self.index.changed_since(watermark).await?,
            None => self.index.all().await?,
        }
        .into_iter()
        .filter(|e| mirror.files.get(&e.file_path) != Some(&ManifestEntry::from(e)))
        .collect();
        let current: BTreeSet<String> = self.index.paths().await?.into_iter().collect();
        let tombstones: Vec<String> = mirror
            .files
            .keys()
            .filter(|path| !current.contains(*path))
            .cloned()
            .collect();

        if changed.is_empty() && tombstones.is_empty() {
            tracing::info!("Files incremental skipped: nothing changed");
            return Ok(BackupRun::skipped("no files changed since the last backup"));
        }

        let (created_at, file_name) = artifact::unique_tar_artifact(
            &self.backup_root,
            BackupClass::Files,
            BackupKind::Incremental,
            now_ms(),
        );
        let watermark = changed.iter().map(|e| e.uploaded_at).max().max(since);
        let manifest = FilesManifest {
            kind: BackupKind::Incremental,
            created_at,
            base_backup_id: Some(full.id),
            previous_backup_id: Some(previous.id),
            watermark,
            entries: Vec::new(),
            tombstones,
            warnings: Vec::new(),
        };

        let (written, manifest) = self.write_artifact(file_name, changed, manifest).await?;
        let record = self
            .register(&written, &manifest, BackupKind::Incremental, Some(full.id))
            .await?;

        mirror.apply(&manifest);
        mirror.backup_id = record.id;
        self.save_mirror(&mirror).await?;

        tracing::info!(
            "Files incremental backup {} written ({} files, {} tombstones, base {})",
            record.file_name,
            manifest.entries.len(),
            manifest.tombstones.len(),
            full.id
        );
        Ok(BackupRun {
            record: Some(record),
            warnings: manifest.warnings,
            ..Default::default()
        })
    }

    pub async fn stats(&self) -> Result<BackupStats> {
        self.catalog.stats(BackupClass::Files).await
    }

    /// Rebuild the upload tree under `dest` from the newest full and its incrementals
    pub async fn restore_files_to(&self, dest: &Path) -> Result<FilesRestoreReport> {
        let (full, chain) = self
            .catalog
            .latest_chain(BackupClass::Files)
            .await?
            .ok_or(AppError::BackupNotFound)?;

        let backup_root = self.backup_root.clone();
        let dest = dest.to_path_buf();
        let artifacts: Vec<String> = std::iter::once(&full)
            .chain(chain.iter())
            .map(|r| r.file_path.clone())
            .collect();
        let full_id = full.id;

        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dest)?;
            let mut restored = 0usize;
            let mut removed = 0usize;
            for rel in &artifacts {
                let path = backup_root.join(rel);
                let manifest = read_manifest(&path)?;
                restored += unpack_files(&path, &dest)?;
                for gone in &manifest.tombstones {
                    if !FileMetadataEntry::validate_path(gone) {
                        continue;
                    }
                    match fs::remove_file(dest.join(gone)) {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(AppError::from(e)),
                    }
                }
            }
            tracing::info!(
                "Restored {} file(s) from {} artifact(s), {} removed",
                restored,
                artifacts.len(),
                removed
            );
            Ok(FilesRestoreReport {
                full_backup_id: full_id,
                incrementals_applied: artifacts.len() - 1,
                files_restored: restored,
                files_removed: removed,
            })
        })
        .await?
    }

    async fn fall_back_to_full(&self, reason: &str) -> Result<BackupRun> {
        tracing::warn!("Files incremental falling back to full backup: {}", reason);
        let mut run = self.run_full_backup().await?;
        run.fallback = Some(reason.to_string());
        Ok(run)
    }

    /// Copy `entries` into a new artifact, recording missing files as warnings
    async fn write_artifact(
        &self,
        file_name: String,
        entries: Vec<FileMetadataEntry>,
        mut manifest: FilesManifest,
    ) -> Result<(WrittenArtifact, FilesManifest)> {
        let backup_root = self.backup_root.clone();
        let uploads_dir = self.uploads_dir.clone();
        let kind = manifest.kind;

        tokio::task::spawn_blocking(move || {
            let rel_dir = artifact::relative_dir(BackupClass::Files, kind);
            let (partial, file) = PartialFile::create(&backup_root, rel_dir, &file_name)?;
            let mut tar = TarGzWriter::new(file);

            for entry in &entries {
                let source = uploads_dir.join(&entry.file_path);
                let name = format!("{}{}", FILES_ENTRY_PREFIX, entry.file_path);
                if !FileMetadataEntry::validate_path(&entry.file_path) {
                    manifest
                        .warnings
                        .push(format!("{}: invalid path, skipped", entry.file_path));
                    continue;
                }
                match tar.append_file(&name, &source) {
                    Ok(()) => manifest.entries.push(ManifestEntry::from(entry)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::warn!("Indexed file missing on disk: {}", entry.file_path);
                        manifest
                            .warnings
                            .push(format!("{}: missing on disk", entry.file_path));
                    }
                    Err(e) => return Err(AppError::from(e)),
                }
            }

            tar.append_bytes(MANIFEST_ENTRY, &serde_json::to_vec_pretty(&manifest)?)?;
            let written = partial.commit(tar.finish()?)?;
            Ok((written, manifest))
        })
        .await?
    }

    async fn register(
        &self,
        written: &WrittenArtifact,
        manifest: &FilesManifest,
        kind: BackupKind,
        base_backup_id: Option<i64>,
    ) -> Result<BackupRecord> {
        let new = NewBackupRecord {
            class: BackupClass::Files,
            kind,
            file_name: written.file_name.clone(),
            file_path: written.rel_path.clone(),
            size_bytes: written.size_bytes,
            created_at: manifest.created_at,
            base_backup_id,
            checksum: written.checksum.clone(),
            watermark: Some(Watermark::Upload {
                uploaded_at: manifest.watermark,
            }),
            item_count: manifest.entries.len() as i64,
            note: (!manifest.warnings.is_empty())
                .then(|| format!("{} file(s) missing on disk", manifest.warnings.len())),
        };
        match self.catalog.insert_record(&new).await {
            Ok(record) => Ok(record),
            Err(e) => {
                written.discard();
                Err(e)
            }
        }
    }

    fn mirror_path(&self) -> PathBuf {
        self.file_index_dir.join(FILE_INDEX_FILE_NAME)
    }

    /// Mirror of the chain ending at the newest record, rebuilt from the
    /// artifacts' manifests when the saved one is stale
    async fn load_mirror(
        &self,
        full: &BackupRecord,
        chain: &[BackupRecord],
    ) -> std::result::Result<ChainMirror, String> {
        let tip = chain.last().unwrap_or(full).id;
        if let Ok(bytes) = tokio::fs::read(self.mirror_path()).await {
            if let Ok(mirror) = serde_json::from_slice::<ChainMirror>(&bytes) {
                if mirror.backup_id == tip && mirror.full_id == full.id {
                    return Ok(mirror);
                }
            }
        }

        tracing::info!("Rebuilding file index mirror from backup manifests");
        let paths: Vec<PathBuf> = std::iter::once(full)
            .chain(chain.iter())
            .map(|r| self.backup_root.join(&r.file_path))
            .collect();
        let full_id = full.id;

        let rebuilt = tokio::task::spawn_blocking(move || {
            let mut mirror = ChainMirror {
                backup_id: tip,
                full_id,
                files: BTreeMap::new(),
            };
            for path in &paths {
                let manifest = read_manifest(path)
                    .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
                mirror.apply(&manifest);
            }
            Ok::<_, String>(mirror)
        })
        .await
        .map_err(|e| e.to_string())??;

        self.save_mirror(&rebuilt).await.map_err(|e| e.to_string())?;
        Ok(rebuilt)
    }

    async fn save_mirror(&self, mirror: &ChainMirror) -> Result<()> {
        tokio::fs::create_dir_all(&self.file_index_dir).await?;
        let path = self.mirror_path();
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(mirror)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Read and parse `manifest.json` of a files artifact
pub fn read_manifest(artifact_path: &Path) -> Result<FilesManifest> {
    let bytes = artifact::read_entry(artifact_path, MANIFEST_ENTRY)?.ok_or_else(|| {
        AppError::IntegrityFailure(format!("{} has no manifest", artifact_path.display()))
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Unpack every `files/` entry of an artifact under `dest`
fn unpack_files(artifact_path: &Path, dest: &Path) -> Result<usize> {
    let mut archive = artifact::open_tar_gz(artifact_path)?;
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let Some(rel) = name.strip_prefix(FILES_ENTRY_PREFIX) else {
            continue;
        };
        if !FileMetadataEntry::validate_path(rel) {
            tracing::warn!("Skipping archive entry with unsafe path: {}", name);
            continue;
        }
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        count += 1;
    }
    Ok(count)
}
