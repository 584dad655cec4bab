//! Migration-specific error types

use crate::executor::DbError;
use std::fmt;

/// History-table failures: creation, read, insert, or a missing session.
#[derive(Debug)]
pub enum StoreError {
    /// Backend used before `connect()` or after `disconnect()`
    NotConnected,
    /// Session could not be opened
    Connection(String),
    /// History table does not exist; `ensure_migrations` was not called
    TableMissing(String),
    /// A record for `(namespace, level)` already exists and no override was requested
    Duplicate { namespace: String, level: i64 },
    /// Underlying database failure
    Database(DbError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotConnected => write!(f, "Migration store is not connected"),
            StoreError::Connection(msg) => write!(f, "Could not connect migration store: {msg}"),
            StoreError::TableMissing(table) => write!(
                f,
                "Migration table '{table}' does not exist; call ensure_migrations() first"
            ),
            StoreError::Duplicate { namespace, level } => write!(
                f,
                "Migration {level} in namespace '{namespace}' is already recorded"
            ),
            StoreError::Database(e) => write!(f, "Migration store error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(error: DbError) -> Self {
        StoreError::Database(error)
    }
}

/// Lock primitive failures.
#[derive(Debug)]
pub enum LockError {
    /// Backend used before `connect()` or after `disconnect()`
    NotConnected,
    /// `unlock_migrations` called by an instance that does not hold the lock
    NotHeld,
    /// `lock_migrations` called again by the instance that already holds the lock
    AlreadyHeld,
    /// Lock storage is absent (table strategy before `ensure_migrations`)
    Unavailable(String),
    /// Underlying database failure
    Database(DbError),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::NotConnected => write!(f, "Migration lock is not connected"),
            LockError::NotHeld => {
                write!(f, "Migration lock released by an instance that does not hold it")
            }
            LockError::AlreadyHeld => write!(f, "Migration lock is already held by this instance"),
            LockError::Unavailable(msg) => write!(f, "Migration lock unavailable: {msg}"),
            LockError::Database(e) => write!(f, "Migration lock error: {e}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for LockError {
    fn from(error: DbError) -> Self {
        LockError::Database(error)
    }
}

/// The migration a failed execution belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMigration {
    pub level: i64,
    pub namespace: String,
    pub script: String,
}

/// A migration script failed to execute. Nothing was recorded for it and the
/// lock was released before this error was returned.
#[derive(Debug)]
pub struct MigrationExecutionError {
    pub migration: FailedMigration,
    pub cause: DbError,
}

impl fmt::Display for MigrationExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Migration {} in namespace '{}' failed during execution: {}",
            self.migration.level, self.migration.namespace, self.cause
        )
    }
}

impl std::error::Error for MigrationExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// An embedded directive could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveError {
    pub line: usize,
    pub key: String,
    pub value: String,
}

impl fmt::Display for DirectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid value '{}' for directive {} on line {} (expected true or false)",
            self.value, self.key, self.line
        )
    }
}

impl std::error::Error for DirectiveError {}

/// Everything `run_migration` and friends can fail with
#[derive(Debug)]
pub enum MigrationError {
    Store(StoreError),
    Lock(LockError),
    Execution(MigrationExecutionError),
    Directive(DirectiveError),
    /// Recorded checksum differs from the submitted script under `DriftPolicy::Reject`
    ChecksumMismatch {
        namespace: String,
        level: i64,
        stored: String,
        current: String,
    },
    /// Migration directory could not be read
    FileNotFound(String),
    /// Migration file name or content is malformed
    InvalidFormat(String),
}

impl MigrationError {
    /// The offending migration, when the failure came from its script.
    pub fn migration(&self) -> Option<&FailedMigration> {
        match self {
            MigrationError::Execution(e) => Some(&e.migration),
            _ => None,
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Store(e) => write!(f, "{e}"),
            MigrationError::Lock(e) => write!(f, "{e}"),
            MigrationError::Execution(e) => write!(f, "{e}"),
            MigrationError::Directive(e) => write!(f, "{e}"),
            MigrationError::ChecksumMismatch {
                namespace,
                level,
                stored,
                current,
            } => write!(
                f,
                "Migration {level} in namespace '{namespace}' \
                 has been modified after being applied.\n\
                 Stored checksum: {stored}\n\
                 Current checksum: {current}"
            ),
            MigrationError::FileNotFound(path) => {
                write!(f, "Migration directory not found: {path}")
            }
            MigrationError::InvalidFormat(msg) => write!(f, "Invalid migration format: {msg}"),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Store(e) => Some(e),
            MigrationError::Lock(e) => Some(e),
            MigrationError::Execution(e) => Some(e),
            MigrationError::Directive(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for MigrationError {
    fn from(error: StoreError) -> Self {
        MigrationError::Store(error)
    }
}

impl From<LockError> for MigrationError {
    fn from(error: LockError) -> Self {
        MigrationError::Lock(error)
    }
}

impl From<MigrationExecutionError> for MigrationError {
    fn from(error: MigrationExecutionError) -> Self {
        MigrationError::Execution(error)
    }
}

impl From<DirectiveError> for MigrationError {
    fn from(error: DirectiveError) -> Self {
        MigrationError::Directive(error)
    }
}
