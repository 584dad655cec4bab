//! Migration engine
//!
//! Applies versioned SQL scripts exactly once per `(namespace, level)`, serialized
//! across instances by a database-resident lock, and keeps an append-only history.
//!
//! - [`Migration`]: the input (level, namespace, script, comment, timestamp, directives)
//! - [`MigrationRecord`]: one history row
//! - [`MigrationStore`], [`Locker`], [`ScriptExecutor`]: the capabilities a backend provides
//! - [`MigrationRunner`]: ensure → lock → check → execute → record → unlock
//! - [`Driver`]: one backend instance plus the runner, the public entry point
//! - [`PostgresBackend`] and [`MemoryBackend`]: the shipped backends
//!
//! # Example
//!
//! ```rust
//! use tideline::migration::{Directives, Driver, MemoryDatabase, Migration, RunOutcome};
//!
//! let database = MemoryDatabase::new();
//! let mut driver = Driver::new(database.backend());
//! driver.connect()?;
//!
//! let create = Migration::new(1, "CREATE TABLE users (id BIGINT PRIMARY KEY)")
//!     .with_comment("create users");
//! assert!(matches!(driver.run_migration(&create)?, RunOutcome::Applied(_)));
//! assert!(matches!(driver.run_migration(&create)?, RunOutcome::AlreadyApplied(_)));
//!
//! let refresh = Migration::new(2, "SELECT 1").with_directives(Directives::default().audit(false));
//! assert_eq!(driver.run_migration(&refresh)?, RunOutcome::Executed);
//!
//! assert_eq!(driver.get_migrations(None)?.len(), 1);
//! driver.disconnect()?;
//! # Ok::<(), tideline::migration::MigrationError>(())
//! ```

pub mod checksum;
pub mod directives;
pub mod driver;
pub mod error;
pub mod file;
pub mod lock;
pub mod memory;
#[allow(clippy::module_inception)]
pub mod migration;
pub mod postgres;
pub mod record;
pub mod runner;
pub mod startup;
pub mod status;
pub mod store;

pub use checksum::calculate_checksum;
pub use directives::{resolve_directives, DirectivePrecedence, ResolvedDirectives};
pub use driver::{Backend, Driver};
pub use error::{
    DirectiveError, FailedMigration, LockError, MigrationError, MigrationExecutionError, StoreError,
};
pub use file::{discover_migrations, MigrationFile};
pub use lock::{LockGuard, Locker};
pub use memory::{MemoryBackend, MemoryDatabase};
pub use migration::{Directives, Migration, DEFAULT_NAMESPACE};
pub use postgres::PostgresBackend;
pub use record::MigrationRecord;
pub use runner::{DriftPolicy, MigrationRunner, RunOutcome, RunnerOptions, ScriptExecutor};
pub use startup::startup_migrations;
pub use status::{DriftedMigration, MigrationStatus, PendingMigration};
pub use store::{InsertMode, MigrationStore};
