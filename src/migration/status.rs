//! Migration status tracking

use crate::migration::directives::parse_embedded;
use crate::migration::file::MigrationFile;
use crate::migration::MigrationRecord;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Discovered files compared against the history of one namespace
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Latest record per level; superseded rows are folded away
    pub applied: Vec<MigrationRecord>,

    /// Files with no record yet, plus repeatable files (which never get one)
    pub pending: Vec<PendingMigration>,

    /// Files whose content no longer matches what was recorded
    pub drifted: Vec<DriftedMigration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingMigration {
    pub level: i64,
    pub comment: String,
    pub path: PathBuf,
    pub checksum: String,
    /// Declares `AUDIT = false`; runs on every pass and is never recorded
    pub repeatable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftedMigration {
    pub level: i64,
    pub path: PathBuf,
    pub stored_checksum: String,
    pub current_checksum: String,
}

impl MigrationStatus {
    /// `records` must belong to the files' namespace, in `get_migrations` order.
    #[must_use]
    pub fn compute(files: &[MigrationFile], records: &[MigrationRecord]) -> Self {
        // Later rows for a level supersede earlier ones
        let mut latest: BTreeMap<i64, &MigrationRecord> = BTreeMap::new();
        for record in records {
            latest.insert(record.level, record);
        }

        let mut pending = Vec::new();
        let mut drifted = Vec::new();

        for file in files {
            let repeatable = parse_embedded(&file.script)
                .ok()
                .and_then(|d| d.audit)
                .map_or(false, |audit| !audit);

            match latest.get(&file.level) {
                Some(record) if record.checksum != file.checksum => drifted.push(DriftedMigration {
                    level: file.level,
                    path: file.path.clone(),
                    stored_checksum: record.checksum.clone(),
                    current_checksum: file.checksum.clone(),
                }),
                Some(_) => {}
                None => pending.push(PendingMigration {
                    level: file.level,
                    comment: file.comment.clone(),
                    path: file.path.clone(),
                    checksum: file.checksum.clone(),
                    repeatable,
                }),
            }
        }

        Self {
            applied: latest.into_values().cloned().collect(),
            pending,
            drifted,
        }
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// No file is waiting to be recorded and nothing has drifted. Repeatable files
    /// do not count against this.
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.drifted.is_empty() && self.pending.iter().all(|p| p.repeatable)
    }

    #[must_use]
    pub fn latest_applied_level(&self) -> Option<i64> {
        self.applied.iter().map(|r| r.level).max()
    }

    #[must_use]
    pub fn next_pending_level(&self) -> Option<i64> {
        self.pending.iter().find(|p| !p.repeatable).map(|p| p.level)
    }
}
