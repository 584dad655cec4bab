//! MigrationRunner - applies one migration exactly once
//!
//! The runner walks a fixed sequence for every call:
//!
//! ```text
//! ensure table -> acquire lock -> check history -> execute -> record -> release lock
//! ```
//!
//! The lock is held through a [`LockGuard`], so it is released on every exit path
//! including errors and panics between acquisition and recording.

use super::directives::{resolve_directives, DirectivePrecedence, ResolvedDirectives};
use super::error::{FailedMigration, MigrationError, MigrationExecutionError};
use super::lock::{LockGuard, Locker};
use super::migration::Migration;
use super::record::MigrationRecord;
use super::store::{InsertMode, MigrationStore};
use crate::executor::DbError;
use chrono::Utc;
use serde::Deserialize;
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Runs migration scripts against the database
pub trait ScriptExecutor {
    /// Execute a whole script body. Either all of it takes effect or the error is returned.
    fn execute_script(&self, script: &str) -> Result<(), DbError>;
}

/// What to do when the recorded checksum for a level differs from the submitted script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriftPolicy {
    /// Execute again and append a superseding record
    #[default]
    Reapply,
    /// Refuse with `MigrationError::ChecksumMismatch`
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunnerOptions {
    pub directive_precedence: DirectivePrecedence,
    pub drift_policy: DriftPolicy,
}

/// Result of a successful `run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// First application; the new record
    Applied(MigrationRecord),
    /// Script changed since it was recorded and was applied again
    Reapplied(MigrationRecord),
    /// `audit = false`: executed, deliberately not recorded
    Executed,
    /// Same script already recorded for this level; nothing ran
    AlreadyApplied(MigrationRecord),
    /// `skip = true`: neither executed nor recorded
    Skipped,
}

impl RunOutcome {
    /// The record written by this run, if any.
    pub fn record(&self) -> Option<&MigrationRecord> {
        match self {
            RunOutcome::Applied(r) | RunOutcome::Reapplied(r) => Some(r),
            _ => None,
        }
    }

    /// Whether the script was executed.
    pub fn executed(&self) -> bool {
        matches!(
            self,
            RunOutcome::Applied(_) | RunOutcome::Reapplied(_) | RunOutcome::Executed
        )
    }
}

/// Core migration execution engine over a store, a lock and a script executor.
pub struct MigrationRunner<'a> {
    store: &'a dyn MigrationStore,
    locker: &'a dyn Locker,
    executor: &'a dyn ScriptExecutor,
    options: RunnerOptions,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(
        store: &'a dyn MigrationStore,
        locker: &'a dyn Locker,
        executor: &'a dyn ScriptExecutor,
        options: RunnerOptions,
    ) -> Self {
        Self {
            store,
            locker,
            executor,
            options,
        }
    }

    /// Apply `migration` unless history says it already was.
    ///
    /// # Errors
    ///
    /// - `MigrationError::Directive` for an unreadable embedded directive (nothing touched)
    /// - `MigrationError::Store` / `MigrationError::Lock` for history or lock failures
    /// - `MigrationError::Execution` carrying the level and script when the script fails;
    ///   no record is written and the lock is released first
    /// - `MigrationError::ChecksumMismatch` under `DriftPolicy::Reject`
    pub fn run(&self, migration: &Migration) -> Result<RunOutcome, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span =
            tracing_helpers::run_migration_span(migration.namespace(), migration.level()).entered();

        let directives = resolve_directives(
            migration.script(),
            migration.directives(),
            self.options.directive_precedence,
        )?;

        self.store.ensure_migrations()?;
        let guard = LockGuard::acquire(self.locker)?;

        let outcome = self.run_locked(migration, &directives);

        match (outcome, guard.release()) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(release)) => Err(release.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                log::warn!("failed to release migration lock after error: {release}");
                Err(e)
            }
        }
    }

    fn run_locked(
        &self,
        migration: &Migration,
        directives: &ResolvedDirectives,
    ) -> Result<RunOutcome, MigrationError> {
        let namespace = migration.namespace();
        let level = migration.level();

        if directives.skip {
            log::debug!("skipping migration {level} in '{namespace}' by directive");
            #[cfg(feature = "metrics")]
            METRICS.record_skipped(namespace);
            return Ok(RunOutcome::Skipped);
        }

        // Repeatable migrations never consult history
        let previous = if directives.audit {
            self.store.find_migration(namespace, level)?
        } else {
            None
        };

        let mode = match &previous {
            Some(record) if record.checksum == migration.checksum() => {
                log::debug!("migration {level} in '{namespace}' already applied");
                #[cfg(feature = "metrics")]
                METRICS.record_skipped(namespace);
                return Ok(RunOutcome::AlreadyApplied(record.clone()));
            }
            Some(record) => match self.options.drift_policy {
                DriftPolicy::Reject => {
                    return Err(MigrationError::ChecksumMismatch {
                        namespace: namespace.to_string(),
                        level,
                        stored: record.checksum.clone(),
                        current: migration.checksum().to_string(),
                    });
                }
                DriftPolicy::Reapply => {
                    log::warn!(
                        "migration {level} in '{namespace}' changed since it was applied; \
                         re-applying"
                    );
                    InsertMode::Supersede
                }
            },
            None => InsertMode::Unique,
        };

        let start = Instant::now();
        if let Err(cause) = self.executor.execute_script(migration.script()) {
            log::error!("migration {level} in '{namespace}' failed: {cause}");
            #[cfg(feature = "metrics")]
            METRICS.record_failure(namespace);
            return Err(MigrationExecutionError {
                migration: FailedMigration {
                    level,
                    namespace: namespace.to_string(),
                    script: migration.script().to_string(),
                },
                cause,
            }
            .into());
        }
        let elapsed = start.elapsed();
        #[cfg(feature = "metrics")]
        METRICS.record_applied(namespace, elapsed);

        if !directives.audit {
            log::info!("executed repeatable migration {level} in '{namespace}' (not recorded)");
            return Ok(RunOutcome::Executed);
        }

        let record = MigrationRecord {
            level,
            namespace: namespace.to_string(),
            comment: directives.comment_or(migration.comment()).to_string(),
            timestamp: migration.timestamp(),
            checksum: migration.checksum().to_string(),
            applied_at: Utc::now(),
            execution_time_ms: Some(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)),
        };
        self.store.insert_migration(&record, mode)?;
        log::info!("applied migration {level} in '{namespace}' in {elapsed:?}");

        Ok(match mode {
            InsertMode::Unique => RunOutcome::Applied(record),
            InsertMode::Supersede => RunOutcome::Reapplied(record),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::error::{LockError, StoreError};
    use crate::migration::migration::Directives;
    use std::cell::{Cell, RefCell};

    /// Single-threaded stand-ins recording every call in order.
    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
        rows: RefCell<Vec<MigrationRecord>>,
        locked: Cell<bool>,
        fail_scripts: bool,
        fail_unlock: bool,
    }

    impl Recorder {
        fn log(&self, call: &str) {
            self.calls.borrow_mut().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl MigrationStore for Recorder {
        fn ensure_migrations(&self) -> Result<(), StoreError> {
            self.log("ensure");
            Ok(())
        }

        fn drop_migrations(&self) -> Result<(), StoreError> {
            self.rows.borrow_mut().clear();
            Ok(())
        }

        fn get_migrations(
            &self,
            _namespace: Option<&str>,
        ) -> Result<Vec<MigrationRecord>, StoreError> {
            Ok(self.rows.borrow().clone())
        }

        fn find_migration(
            &self,
            namespace: &str,
            level: i64,
        ) -> Result<Option<MigrationRecord>, StoreError> {
            self.log("find");
            Ok(self
                .rows
                .borrow()
                .iter()
                .rev()
                .find(|r| r.namespace == namespace && r.level == level)
                .cloned())
        }

        fn insert_migration(
            &self,
            record: &MigrationRecord,
            mode: InsertMode,
        ) -> Result<(), StoreError> {
            self.log(&format!("insert:{mode:?}"));
            self.rows.borrow_mut().push(record.clone());
            Ok(())
        }
    }

    impl Locker for Recorder {
        fn lock_migrations(&self) -> Result<(), LockError> {
            assert!(!self.locked.replace(true), "lock taken twice");
            self.log("lock");
            Ok(())
        }

        fn unlock_migrations(&self) -> Result<(), LockError> {
            self.locked.set(false);
            self.log("unlock");
            if self.fail_unlock {
                Err(LockError::NotHeld)
            } else {
                Ok(())
            }
        }
    }

    impl ScriptExecutor for Recorder {
        fn execute_script(&self, _script: &str) -> Result<(), DbError> {
            assert!(self.locked.get(), "scripts must run under the lock");
            self.log("execute");
            if self.fail_scripts {
                Err(DbError::QueryError("syntax error".into()))
            } else {
                Ok(())
            }
        }
    }

    fn run(db: &Recorder, migration: &Migration) -> Result<RunOutcome, MigrationError> {
        run_with(db, migration, RunnerOptions::default())
    }

    fn run_with(
        db: &Recorder,
        migration: &Migration,
        options: RunnerOptions,
    ) -> Result<RunOutcome, MigrationError> {
        MigrationRunner::new(db, db, db, options).run(migration)
    }

    #[test]
    fn first_run_follows_full_sequence() {
        let db = Recorder::default();
        let migration =
            Migration::new(1, "CREATE TABLE foo (id INTEGER)").with_comment("create foo");

        let outcome = run(&db, &migration).unwrap();

        assert_eq!(
            db.calls(),
            ["ensure", "lock", "find", "execute", "insert:Unique", "unlock"]
        );
        let record = outcome.record().expect("applied");
        assert_eq!(record.level, 1);
        assert_eq!(record.namespace, "default");
        assert_eq!(record.comment, "create foo");
        assert_eq!(record.timestamp, migration.timestamp());
        assert_eq!(record.checksum, migration.checksum());
        assert!(!db.locked.get());
    }

    #[test]
    fn identical_rerun_writes_nothing() {
        let db = Recorder::default();
        let migration = Migration::new(1, "CREATE TABLE foo (id INTEGER)");
        run(&db, &migration).unwrap();

        let outcome = run(&db, &migration).unwrap();

        assert!(matches!(outcome, RunOutcome::AlreadyApplied(_)));
        assert!(!outcome.executed());
        assert_eq!(db.rows.borrow().len(), 1);
    }

    #[test]
    fn audit_false_executes_every_time_without_recording() {
        let db = Recorder::default();
        let migration =
            Migration::new(1, "SELECT 1").with_directives(Directives::default().audit(false));

        assert_eq!(run(&db, &migration).unwrap(), RunOutcome::Executed);
        assert_eq!(run(&db, &migration).unwrap(), RunOutcome::Executed);

        assert!(db.rows.borrow().is_empty());
        let executions = db.calls().iter().filter(|c| *c == "execute").count();
        assert_eq!(executions, 2);
        assert!(!db.calls().contains(&"find".to_string()));
    }

    #[test]
    fn skip_directive_does_nothing_under_the_lock() {
        let db = Recorder::default();
        let migration =
            Migration::new(1, "-- @TIDELINE SKIP = true\nCREATE TABLE foo (id INTEGER)");

        assert_eq!(run(&db, &migration).unwrap(), RunOutcome::Skipped);
        assert_eq!(db.calls(), ["ensure", "lock", "unlock"]);
        assert!(db.rows.borrow().is_empty());
    }

    #[test]
    fn embedded_comment_overrides_caller_comment() {
        let db = Recorder::default();
        let migration =
            Migration::new(2, "-- @TIDELINE COMMENT = override\nSELECT 1").with_comment("caller");

        let outcome = run(&db, &migration).unwrap();
        assert_eq!(outcome.record().unwrap().comment, "override");
    }

    #[test]
    fn failed_script_reports_migration_and_releases_lock() {
        let db = Recorder {
            fail_scripts: true,
            ..Default::default()
        };
        let migration = Migration::new(5, "INVALID");

        let err = run(&db, &migration).unwrap_err();

        let failed = err.migration().expect("execution error");
        assert_eq!(failed.level, 5);
        assert_eq!(failed.script, "INVALID");
        assert!(db.rows.borrow().is_empty());
        assert_eq!(db.calls().last().map(String::as_str), Some("unlock"));
        assert!(!db.locked.get());
    }

    #[test]
    fn changed_script_is_reapplied_by_default() {
        let db = Recorder::default();
        run(&db, &Migration::new(1, "CREATE TABLE foo (id INTEGER)")).unwrap();

        let outcome = run(&db, &Migration::new(1, "CREATE TABLE foo (id BIGINT)")).unwrap();

        assert!(matches!(outcome, RunOutcome::Reapplied(_)));
        assert!(db.calls().contains(&"insert:Supersede".to_string()));
        assert_eq!(db.rows.borrow().len(), 2);
    }

    #[test]
    fn changed_script_is_rejected_under_reject_policy() {
        let db = Recorder::default();
        run(&db, &Migration::new(1, "CREATE TABLE foo (id INTEGER)")).unwrap();
        let options = RunnerOptions {
            drift_policy: DriftPolicy::Reject,
            ..Default::default()
        };

        let changed = Migration::new(1, "CREATE TABLE foo (id BIGINT)");
        let err = run_with(&db, &changed, options).unwrap_err();

        assert!(matches!(err, MigrationError::ChecksumMismatch { level: 1, .. }));
        assert_eq!(db.rows.borrow().len(), 1);
        assert!(!db.locked.get());
    }

    #[test]
    fn invalid_directive_fails_before_touching_the_database() {
        let db = Recorder::default();
        let migration = Migration::new(1, "-- @TIDELINE AUDIT = sometimes\nSELECT 1");
        let err = run(&db, &migration).unwrap_err();
        assert!(matches!(err, MigrationError::Directive(_)));
        assert!(db.calls().is_empty());
    }

    #[test]
    fn release_failure_after_success_is_reported() {
        let db = Recorder {
            fail_unlock: true,
            ..Default::default()
        };
        let err = run(&db, &Migration::new(1, "SELECT 1")).unwrap_err();
        assert!(matches!(err, MigrationError::Lock(LockError::NotHeld)));
    }
}
