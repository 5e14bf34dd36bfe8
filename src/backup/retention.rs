//! Retention of database and files backups
//!
//! [`plan`] decides, without touching anything, which records may go.
//! [`sweep`] executes a plan through the catalog's guarded delete.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::catalog::Catalog;
use crate::constants::DAY_MS;
use crate::error::{AppError, Result};
use crate::models::{BackupClass, BackupKind, BackupRecord};

/// Per-class retention rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: i64,
    pub min_keep_count: usize,
}

/// Records selected for deletion, dependents before their base
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub delete: Vec<i64>,
}

/// Pure retention decision over the records of one class
///
/// A record is eligible when it is older than `max_age_days` and at least
/// `min_keep_count` newer valid records exist. Incrementals of one chain only
/// make sense together, so a chain's incrementals go only when all of them
/// are eligible, and the full goes only when it is eligible and its whole
/// chain goes with it.
pub fn plan<F>(records: &[BackupRecord], is_valid: F, policy: RetentionPolicy, now: i64) -> RetentionPlan
where
    F: Fn(&BackupRecord) -> bool,
{
    let mut newest_first: Vec<&BackupRecord> = records.iter().collect();
    newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

    let max_age_ms = policy.max_age_days.saturating_mul(DAY_MS);
    let mut eligible = HashSet::new();
    let mut newer_valid = 0usize;
    for record in &newest_first {
        let old_enough = now - record.created_at > max_age_ms;
        if old_enough && newer_valid >= policy.min_keep_count {
            eligible.insert(record.id);
        }
        if is_valid(record) {
            newer_valid += 1;
        }
    }

    let mut chains: HashMap<i64, Vec<&BackupRecord>> = HashMap::new();
    for record in records.iter().filter(|r| r.kind == BackupKind::Incremental) {
        if let Some(base) = record.base_backup_id {
            chains.entry(base).or_default().push(record);
        }
    }

    let mut incrementals = Vec::new();
    let mut fulls = Vec::new();
    for full in newest_first.iter().rev().filter(|r| r.kind == BackupKind::Full) {
        let chain = chains.get(&full.id).map(Vec::as_slice).unwrap_or(&[]);
        let chain_eligible = chain.iter().all(|r| eligible.contains(&r.id));
        if !chain_eligible {
            continue;
        }
        let mut chain: Vec<&BackupRecord> = chain.to_vec();
        chain.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        incrementals.extend(chain.iter().map(|r| r.id));
        if eligible.contains(&full.id) {
            fulls.push(full.id);
        }
    }

    incrementals.extend(fulls);
    RetentionPlan {
        delete: incrementals,
    }
}

/// Result of one retention sweep
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub class: Option<BackupClass>,
    pub deleted: Vec<String>,
    pub kept: usize,
}

/// A record counts toward the minimum only if its artifact is there and it
/// has not failed verification
pub fn is_valid(backup_root: &Path, record: &BackupRecord) -> bool {
    !record.failed_verification() && backup_root.join(&record.file_path).is_file()
}

/// Apply `policy` to `class`, deleting records then their artifacts
pub async fn sweep(
    catalog: &Catalog,
    backup_root: &Path,
    class: BackupClass,
    policy: RetentionPolicy,
    now: i64,
) -> Result<RetentionReport> {
    let records = catalog.list(Some(class)).await?;
    let plan = plan(&records, |r| is_valid(backup_root, r), policy, now);

    let mut report = RetentionReport {
        class: Some(class),
        deleted: Vec::new(),
        kept: records.len() - plan.delete.len(),
    };
    for id in plan.delete {
        let record = delete_backup(catalog, backup_root, id).await?;
        report.deleted.push(record.file_name);
    }

    if !report.deleted.is_empty() {
        tracing::info!(
            "Retention removed {} {} backup(s), {} kept",
            report.deleted.len(),
            class,
            report.kept
        );
    }
    Ok(report)
}

/// Delete one backup: record first, then its artifact file
///
/// A full that still has incrementals is refused with a retention violation.
pub async fn delete_backup(catalog: &Catalog, backup_root: &Path, id: i64) -> Result<BackupRecord> {
    let record = match catalog.delete_record(id).await {
        Ok(record) => record,
        Err(AppError::RetentionViolation(msg)) => {
            tracing::warn!("Retention policy violation: {}", msg);
            return Err(AppError::RetentionViolation(msg));
        }
        Err(e) => return Err(e),
    };

    let path = backup_root.join(&record.file_path);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Record {} removed but artifact {:?} remains: {}", id, path, e),
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 100 * DAY_MS;

    fn record(id: i64, kind: BackupKind, age_days: i64, base: Option<i64>) -> BackupRecord {
        BackupRecord {
            id,
            class: BackupClass::Database,
            kind,
            file_name: format!("r{}", id),
            file_path: format!("database/r{}", id),
            size_bytes: 1,
            created_at: NOW - age_days * DAY_MS - id,
            base_backup_id: base,
            checksum: String::new(),
            watermark: None,
            item_count: 0,
            note: None,
            verify_status: None,
            verified_at: None,
        }
    }

    fn policy(max_age_days: i64, min_keep_count: usize) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days,
            min_keep_count,
        }
    }

    #[test]
    fn test_min_keep_survives_when_everything_is_old() {
        let records: Vec<_> = (1..=6)
            .map(|i| record(i, BackupKind::Full, 50 + i, None))
            .collect();

        let plan = plan(&records, |_| true, policy(30, 3), NOW);
        assert_eq!(plan.delete.len(), 3);
        // The three newest (ids 1..=3) stay
        for id in 1..=3 {
            assert!(!plan.delete.contains(&id));
        }
    }

    #[test]
    fn test_invalid_backups_do_not_count_toward_minimum() {
        let records: Vec<_> = (1..=4)
            .map(|i| record(i, BackupKind::Full, 50 + i, None))
            .collect();

        // Only id 4 (the oldest) is valid
        let plan = plan(&records, |r| r.id == 4, policy(30, 1), NOW);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn test_young_backups_are_kept() {
        let records: Vec<_> = (1..=5)
            .map(|i| record(i, BackupKind::Full, i, None))
            .collect();
        assert!(plan(&records, |_| true, policy(30, 1), NOW).delete.is_empty());
    }

    #[test]
    fn test_chain_goes_together_dependents_first() {
        let records = vec![
            record(1, BackupKind::Full, 60, None),
            record(2, BackupKind::Incremental, 59, Some(1)),
            record(3, BackupKind::Incremental, 58, Some(1)),
            record(4, BackupKind::Full, 2, None),
            record(5, BackupKind::Full, 1, None),
        ];

        let plan = plan(&records, |_| true, policy(30, 2), NOW);
        assert_eq!(plan.delete, vec![3, 2, 1]);
    }

    #[test]
    fn test_base_kept_while_a_dependent_is_young() {
        let records = vec![
            record(1, BackupKind::Full, 60, None),
            record(2, BackupKind::Incremental, 59, Some(1)),
            record(3, BackupKind::Incremental, 1, Some(1)),
            record(4, BackupKind::Full, 0, None),
        ];

        let plan = plan(&records, |_| true, policy(30, 1), NOW);
        assert!(plan.delete.is_empty());
    }
}
