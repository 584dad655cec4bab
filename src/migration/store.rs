//! The migration history table, as seen by the runner

use super::error::StoreError;
use super::record::MigrationRecord;

/// How `insert_migration` treats an existing record for the same `(namespace, level)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Fail with `StoreError::Duplicate`
    Unique,
    /// Append a superseding row; the newest row for a level is the current one
    Supersede,
}

/// Append-only store of applied migrations, scoped by namespace.
///
/// Backends own the concrete schema. Rows are never updated or deleted in place;
/// `drop_migrations` removes the whole table and exists for tests and operators.
pub trait MigrationStore {
    /// Create the history table if absent. Idempotent, and safe when several
    /// instances race on a fresh database.
    fn ensure_migrations(&self) -> Result<(), StoreError>;

    /// Remove the history table (and any lock storage that lives with it).
    fn drop_migrations(&self) -> Result<(), StoreError>;

    /// Records for `namespace` (all namespaces when `None`), ordered by ascending
    /// level with ties in insertion order. Empty, never absent, when nothing is recorded.
    fn get_migrations(&self, namespace: Option<&str>) -> Result<Vec<MigrationRecord>, StoreError>;

    /// The most recently inserted record for `(namespace, level)`.
    fn find_migration(
        &self,
        namespace: &str,
        level: i64,
    ) -> Result<Option<MigrationRecord>, StoreError>;

    /// Append one record.
    fn insert_migration(
        &self,
        record: &MigrationRecord,
        mode: InsertMode,
    ) -> Result<(), StoreError>;
}
