//! `MigrationRecord` - one row of the migration history table

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A persisted, successful application of a migration.
///
/// Serializes to the wire shape `{ level, namespace, comment, timestamp, checksum, ... }`
/// with ISO-8601 instants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub level: i64,
    pub namespace: String,
    pub comment: String,
    /// Timestamp carried by the submitted migration
    pub timestamp: DateTime<Utc>,
    /// `SHA-256` of the normalized script
    pub checksum: String,
    /// When the engine wrote this row
    pub applied_at: DateTime<Utc>,
    /// Script execution time in milliseconds (`None` if not recorded)
    pub execution_time_ms: Option<i64>,
}

impl MigrationRecord {
    /// Create a `MigrationRecord` from a `PostgreSQL` row.
    ///
    /// Expected column order: `level`, `namespace`, `comment`, `migration_timestamp`,
    /// `checksum`, `applied_at`, `execution_time_ms`
    ///
    /// # Errors
    ///
    /// Returns `DbError::ParseError` if a column is missing or has an unexpected type.
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, crate::DbError> {
        fn col<'a, T: may_postgres::types::FromSql<'a>>(
            row: &'a may_postgres::Row,
            idx: usize,
        ) -> Result<T, crate::DbError> {
            row.try_get(idx)
                .map_err(|e| crate::DbError::ParseError(format!("column {idx}: {e}")))
        }

        Ok(Self {
            level: col(row, 0)?,
            namespace: col(row, 1)?,
            comment: col(row, 2)?,
            timestamp: col(row, 3)?,
            checksum: col(row, 4)?,
            applied_at: col(row, 5)?,
            execution_time_ms: col(row, 6)?,
        })
    }
}
