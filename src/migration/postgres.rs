//! PostgreSQL backend
//!
//! History lives in one table (default `tideline_migrations`):
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS tideline_migrations (
//!     id BIGSERIAL PRIMARY KEY,
//!     level BIGINT NOT NULL,
//!     namespace TEXT NOT NULL DEFAULT 'default',
//!     comment TEXT NOT NULL DEFAULT '',
//!     migration_timestamp TIMESTAMPTZ NOT NULL,
//!     checksum VARCHAR(64) NOT NULL,
//!     applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     execution_time_ms BIGINT
//! );
//! ```
//!
//! Rows are append-only; a superseding row for the same `(namespace, level)` gets a
//! larger `id`, which is the tiebreak when reading.
//!
//! The lock is either a session advisory lock or a single token row in
//! `<table>_lock`, selected with [`LockStrategy`].

use super::driver::Backend;
use super::error::{LockError, MigrationError, StoreError};
use super::lock::Locker;
use super::record::MigrationRecord;
use super::runner::ScriptExecutor;
use super::store::{InsertMode, MigrationStore};
use crate::config::{LockStrategy, TidelineConfig};
use crate::connection::connect;
use crate::executor::{DbError, Executor, MayPostgresExecutor};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const UNDEFINED_TABLE: &str = "42P01";

const RECORD_COLUMNS: &str =
    "level, namespace, comment, migration_timestamp, checksum, applied_at, execution_time_ms";

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,50}$").expect("identifier pattern is valid")
});

/// Migration backend over one `may_postgres` session.
pub struct PostgresBackend {
    url: String,
    table: String,
    lock_strategy: LockStrategy,
    lock_key: i64,
    poll_interval: Duration,
    /// Identifies this instance in the lock row
    holder: String,
    executor: Option<MayPostgresExecutor>,
    holding: AtomicBool,
}

impl PostgresBackend {
    /// Backend with default table name and advisory locking.
    pub fn new(url: impl Into<String>) -> Self {
        let engine = crate::config::EngineConfig::default();
        Self {
            url: url.into(),
            table: engine.table.clone(),
            lock_strategy: engine.lock_strategy,
            lock_key: engine.lock_key,
            poll_interval: engine.lock_poll_interval(),
            holder: uuid::Uuid::new_v4().to_string(),
            executor: None,
            holding: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &TidelineConfig) -> Result<Self, MigrationError> {
        Ok(Self::new(config.database.url.clone())
            .with_table(config.engine.table.clone())?
            .with_lock_strategy(config.engine.lock_strategy)
            .with_lock_key(config.engine.lock_key)
            .with_poll_interval(config.engine.lock_poll_interval()))
    }

    /// Use another history table. The name is interpolated into SQL, so it must be
    /// a plain identifier.
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self, MigrationError> {
        let table = table.into();
        if !IDENTIFIER.is_match(&table) {
            return Err(MigrationError::InvalidFormat(format!(
                "'{table}' is not a valid migration table name"
            )));
        }
        self.table = table;
        Ok(self)
    }

    pub fn with_lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.lock_strategy = strategy;
        self
    }

    pub fn with_lock_key(mut self, key: i64) -> Self {
        self.lock_key = key;
        self
    }

    /// How often the table strategy retries a contended lock.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn lock_table(&self) -> String {
        format!("{}_lock", self.table)
    }

    fn store_executor(&self) -> Result<&MayPostgresExecutor, StoreError> {
        self.executor.as_ref().ok_or(StoreError::NotConnected)
    }

    fn lock_executor(&self) -> Result<&MayPostgresExecutor, LockError> {
        self.executor.as_ref().ok_or(LockError::NotConnected)
    }

    fn store_error(&self, error: DbError) -> StoreError {
        if is_undefined_table(&error) {
            StoreError::TableMissing(self.table.clone())
        } else {
            StoreError::Database(error)
        }
    }

    fn ensure_sql(&self) -> String {
        let table = &self.table;
        let mut sql = format!(
            "BEGIN;
             SELECT pg_advisory_xact_lock({guard});
             CREATE TABLE IF NOT EXISTS {table} (
                 id BIGSERIAL PRIMARY KEY,
                 level BIGINT NOT NULL,
                 namespace TEXT NOT NULL DEFAULT 'default',
                 comment TEXT NOT NULL DEFAULT '',
                 migration_timestamp TIMESTAMPTZ NOT NULL,
                 checksum VARCHAR(64) NOT NULL,
                 applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                 execution_time_ms BIGINT
             );
             CREATE INDEX IF NOT EXISTS idx_{table}_namespace_level ON {table} (namespace, level);",
            guard = self.lock_key.wrapping_add(1),
        );
        if self.lock_strategy == LockStrategy::Table {
            let lock_table = self.lock_table();
            sql.push_str(&format!(
                "
             CREATE TABLE IF NOT EXISTS {lock_table} (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 holder TEXT,
                 holder_pid INTEGER,
                 acquired_at TIMESTAMPTZ
             );
             ALTER TABLE {lock_table} ADD COLUMN IF NOT EXISTS holder_pid INTEGER;
             INSERT INTO {lock_table} (id) VALUES (1) ON CONFLICT (id) DO NOTHING;"
            ));
        }
        sql.push_str("\n             COMMIT;");
        sql
    }

    fn lock_advisory(&self, executor: &MayPostgresExecutor) -> Result<(), LockError> {
        executor.query_all("SELECT pg_advisory_lock($1)", &[&self.lock_key])?;
        Ok(())
    }

    fn unlock_advisory(&self, executor: &MayPostgresExecutor) -> Result<(), LockError> {
        let rows = executor.query_all("SELECT pg_advisory_unlock($1)", &[&self.lock_key])?;
        let released = match rows.first() {
            Some(row) => row
                .try_get::<_, bool>(0)
                .map_err(|e| DbError::ParseError(e.to_string()))?,
            None => false,
        };
        if released {
            Ok(())
        } else {
            Err(LockError::NotHeld)
        }
    }

    /// Claims the token row when it is free, or when its holder's session no
    /// longer exists (crashed or terminated process).
    fn lock_row_sql(&self) -> String {
        format!(
            "UPDATE {} SET holder = $1, holder_pid = pg_backend_pid(), acquired_at = now()
             WHERE id = 1
               AND (holder IS NULL
                    OR holder_pid IS NULL
                    OR holder_pid NOT IN (SELECT pid FROM pg_stat_activity))",
            self.lock_table()
        )
    }

    fn lock_row(&self, executor: &MayPostgresExecutor) -> Result<(), LockError> {
        let sql = self.lock_row_sql();
        loop {
            let acquired = executor
                .execute(&sql, &[&self.holder])
                .map_err(|e| self.lock_error(e))?;
            if acquired == 1 {
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn unlock_row(&self, executor: &MayPostgresExecutor) -> Result<(), LockError> {
        let sql = format!(
            "UPDATE {} SET holder = NULL, holder_pid = NULL, acquired_at = NULL
             WHERE id = 1 AND holder = $1",
            self.lock_table()
        );
        match executor.execute(&sql, &[&self.holder]).map_err(|e| self.lock_error(e))? {
            0 => Err(LockError::NotHeld),
            _ => Ok(()),
        }
    }

    fn lock_error(&self, error: DbError) -> LockError {
        if is_undefined_table(&error) {
            LockError::Unavailable(format!(
                "lock table '{}' does not exist; call ensure_migrations() first",
                self.lock_table()
            ))
        } else {
            LockError::Database(error)
        }
    }
}

impl MigrationStore for PostgresBackend {
    fn ensure_migrations(&self) -> Result<(), StoreError> {
        let executor = self.store_executor()?;
        batch_or_rollback(executor, &self.ensure_sql()).map_err(StoreError::Database)
    }

    fn drop_migrations(&self) -> Result<(), StoreError> {
        let executor = self.store_executor()?;
        executor.execute_batch(&format!(
            "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
            self.table,
            self.lock_table()
        ))?;
        Ok(())
    }

    fn get_migrations(&self, namespace: Option<&str>) -> Result<Vec<MigrationRecord>, StoreError> {
        let executor = self.store_executor()?;
        let rows = match namespace {
            Some(ns) => executor.query_all(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {}
                     WHERE namespace = $1 ORDER BY level ASC, id ASC",
                    self.table
                ),
                &[&ns],
            ),
            None => executor.query_all(
                &format!("SELECT {RECORD_COLUMNS} FROM {} ORDER BY level ASC, id ASC", self.table),
                &[],
            ),
        }
        .map_err(|e| self.store_error(e))?;

        rows.iter()
            .map(|row| MigrationRecord::from_row(row).map_err(StoreError::Database))
            .collect()
    }

    fn find_migration(
        &self,
        namespace: &str,
        level: i64,
    ) -> Result<Option<MigrationRecord>, StoreError> {
        let executor = self.store_executor()?;
        let rows = executor
            .query_all(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {}
                     WHERE namespace = $1 AND level = $2 ORDER BY id DESC LIMIT 1",
                    self.table
                ),
                &[&namespace, &level],
            )
            .map_err(|e| self.store_error(e))?;

        rows.first()
            .map(|row| MigrationRecord::from_row(row).map_err(StoreError::Database))
            .transpose()
    }

    fn insert_migration(
        &self,
        record: &MigrationRecord,
        mode: InsertMode,
    ) -> Result<(), StoreError> {
        let executor = self.store_executor()?;
        let params: [&dyn may_postgres::types::ToSql; 7] = [
            &record.level,
            &record.namespace,
            &record.comment,
            &record.timestamp,
            &record.checksum,
            &record.applied_at,
            &record.execution_time_ms,
        ];

        let sql = match mode {
            InsertMode::Unique => format!(
                "INSERT INTO {table} ({RECORD_COLUMNS})
                 SELECT $1::BIGINT, $2::TEXT, $3::TEXT, $4::TIMESTAMPTZ,
                        $5::TEXT, $6::TIMESTAMPTZ, $7::BIGINT
                 WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE namespace = $2 AND level = $1)",
                table = self.table
            ),
            InsertMode::Supersede => format!(
                "INSERT INTO {} ({RECORD_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                self.table
            ),
        };

        let inserted = executor.execute(&sql, &params).map_err(|e| self.store_error(e))?;
        if inserted == 0 {
            return Err(StoreError::Duplicate {
                namespace: record.namespace.clone(),
                level: record.level,
            });
        }
        Ok(())
    }
}

impl Locker for PostgresBackend {
    fn lock_migrations(&self) -> Result<(), LockError> {
        let executor = self.lock_executor()?;
        // Advisory locks are re-entrant per session; refuse instead of stacking
        if self.holding.load(Ordering::Acquire) {
            return Err(LockError::AlreadyHeld);
        }
        match self.lock_strategy {
            LockStrategy::Advisory => self.lock_advisory(executor)?,
            LockStrategy::Table => self.lock_row(executor)?,
        }
        self.holding.store(true, Ordering::Release);
        log::debug!("migration lock acquired ({:?})", self.lock_strategy);
        Ok(())
    }

    fn unlock_migrations(&self) -> Result<(), LockError> {
        let executor = self.lock_executor()?;
        match self.lock_strategy {
            LockStrategy::Advisory => self.unlock_advisory(executor)?,
            LockStrategy::Table => self.unlock_row(executor)?,
        }
        self.holding.store(false, Ordering::Release);
        log::debug!("migration lock released ({:?})", self.lock_strategy);
        Ok(())
    }
}

impl ScriptExecutor for PostgresBackend {
    fn execute_script(&self, script: &str) -> Result<(), DbError> {
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| DbError::Other("not connected".to_string()))?;
        // Scripts may open their own transaction; the lock release that follows
        // must not land in it
        batch_or_rollback(executor, script)
    }
}

impl Backend for PostgresBackend {
    fn connect(&mut self) -> Result<(), StoreError> {
        if self.executor.is_some() {
            return Ok(());
        }
        let client = connect(&self.url).map_err(|e| StoreError::Connection(e.to_string()))?;
        self.executor = Some(MayPostgresExecutor::new(client));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), StoreError> {
        if self.holding.load(Ordering::Acquire) {
            if let Err(e) = self.unlock_migrations() {
                log::warn!("failed to release migration lock on disconnect: {e}");
            }
        }
        // Dropping the client closes the session, which also ends any advisory lock
        self.executor = None;
        self.holding.store(false, Ordering::Release);
        Ok(())
    }
}

/// Run `script`; on failure roll back whatever transaction it left open, so the
/// session accepts statements again. The script's error is returned.
fn batch_or_rollback(executor: &dyn Executor, script: &str) -> Result<(), DbError> {
    let Err(error) = executor.execute_batch(script) else {
        return Ok(());
    };
    // Outside a transaction this is a no-op warning on the server
    if let Err(rollback) = executor.execute_batch("ROLLBACK") {
        log::debug!("rollback after failed batch also failed: {rollback}");
    }
    Err(error)
}

fn is_undefined_table(error: &DbError) -> bool {
    match error {
        DbError::PostgresError(e) => e.code().map(|state| state.code()) == Some(UNDEFINED_TABLE),
        DbError::QueryError(msg) => msg.contains(UNDEFINED_TABLE),
        _ => false,
    }
}
