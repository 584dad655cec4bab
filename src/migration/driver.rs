//! Driver - the public face of a migration backend
//!
//! A [`Backend`] bundles the three capabilities the runner needs (history store,
//! lock, script execution) with a session lifecycle. [`Driver`] wraps one backend
//! instance and exposes the full driver contract on top of it.

use super::error::{LockError, MigrationError, StoreError};
use super::file::MigrationFile;
use super::lock::Locker;
use super::migration::Migration;
use super::record::MigrationRecord;
use super::runner::{MigrationRunner, RunOutcome, RunnerOptions, ScriptExecutor};
use super::status::MigrationStatus;
use super::store::MigrationStore;

/// A concrete database backend. One value is one instance: its own session and,
/// for locking purposes, its own identity.
pub trait Backend: MigrationStore + Locker + ScriptExecutor {
    /// Open the session.
    fn connect(&mut self) -> Result<(), StoreError>;

    /// Close the session, releasing the lock first if this instance holds it.
    fn disconnect(&mut self) -> Result<(), StoreError>;
}

/// Driver over a single backend instance.
///
/// ```
/// use tideline::migration::{Driver, MemoryDatabase, Migration};
///
/// let database = MemoryDatabase::new();
/// let mut driver = Driver::new(database.backend());
/// driver.connect()?;
/// driver.ensure_migrations()?;
/// driver.run_migration(&Migration::new(1, "CREATE TABLE users (id BIGINT)"))?;
/// assert_eq!(driver.get_migrations(None)?.len(), 1);
/// driver.disconnect()?;
/// # Ok::<(), tideline::migration::MigrationError>(())
/// ```
pub struct Driver<B: Backend> {
    backend: B,
    options: RunnerOptions,
}

impl<B: Backend> Driver<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            options: RunnerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn connect(&mut self) -> Result<(), StoreError> {
        self.backend.connect()
    }

    pub fn disconnect(&mut self) -> Result<(), StoreError> {
        self.backend.disconnect()
    }

    /// Remove the history table entirely. Test and operations utility.
    pub fn drop_migrations(&self) -> Result<(), StoreError> {
        self.backend.drop_migrations()
    }

    pub fn ensure_migrations(&self) -> Result<(), StoreError> {
        self.backend.ensure_migrations()
    }

    pub fn get_migrations(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<MigrationRecord>, StoreError> {
        self.backend.get_migrations(namespace)
    }

    /// Blocks until this instance holds the lock.
    pub fn lock_migrations(&self) -> Result<(), LockError> {
        self.backend.lock_migrations()
    }

    pub fn unlock_migrations(&self) -> Result<(), LockError> {
        self.backend.unlock_migrations()
    }

    pub fn run_migration(&self, migration: &Migration) -> Result<RunOutcome, MigrationError> {
        MigrationRunner::new(&self.backend, &self.backend, &self.backend, self.options)
            .run(migration)
    }

    /// Apply migrations in `(namespace, level)` order, stopping at the first failure.
    pub fn run_migrations(
        &self,
        migrations: &[Migration],
    ) -> Result<Vec<RunOutcome>, MigrationError> {
        let mut ordered: Vec<&Migration> = migrations.iter().collect();
        ordered.sort_by(|a, b| (a.namespace(), a.level()).cmp(&(b.namespace(), b.level())));

        ordered.into_iter().map(|m| self.run_migration(m)).collect()
    }

    /// Compare discovered files with the history of `namespace`.
    ///
    /// Read-only: a missing history table means nothing has been applied yet.
    pub fn status(
        &self,
        namespace: &str,
        files: &[MigrationFile],
    ) -> Result<MigrationStatus, MigrationError> {
        let records = match self.backend.get_migrations(Some(namespace)) {
            Ok(records) => records,
            Err(StoreError::TableMissing(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(MigrationStatus::compute(files, &records))
    }
}
