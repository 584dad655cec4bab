//! In-process database for tests and embedding
//!
//! A [`MemoryDatabase`] is shared state standing in for a database server. Each
//! [`MemoryBackend`] obtained from it behaves like an independent instance with its
//! own session: the history table and the lock token belong to the database, so
//! backends on different threads contend exactly as separate processes would
//! against a real server.
//!
//! Script execution is simulated. Statements are split on `;` and each must start
//! with a recognised SQL keyword; anything else is rejected like a syntax error.

use super::driver::Backend;
use super::error::{LockError, StoreError};
use super::lock::Locker;
use super::record::MigrationRecord;
use super::runner::ScriptExecutor;
use super::store::{InsertMode, MigrationStore};
use crate::executor::DbError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

const TABLE_NAME: &str = "migrations";

const STATEMENT_KEYWORDS: &[&str] = &[
    "ALTER", "ANALYZE", "BEGIN", "COMMENT", "COMMIT", "CREATE", "DELETE", "DO", "DROP", "GRANT",
    "INSERT", "REINDEX", "REVOKE", "ROLLBACK", "SELECT", "SET", "TRUNCATE", "UPDATE", "VACUUM",
    "VALUES", "WITH",
];

#[derive(Default)]
struct State {
    /// `None` until `ensure_migrations` creates the table
    table: Option<Vec<MigrationRecord>>,
    lock_holder: Option<u64>,
    executed: Vec<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    lock_released: Condvar,
    next_instance: AtomicU64,
}

/// Shared in-memory database. Cloning yields another handle to the same database.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, disconnected backend instance over this database.
    pub fn backend(&self) -> MemoryBackend {
        MemoryBackend {
            database: self.clone(),
            instance: self.shared.next_instance.fetch_add(1, Ordering::Relaxed) + 1,
            connected: false,
        }
    }

    /// Scripts executed successfully so far, in order.
    pub fn executed_scripts(&self) -> Vec<String> {
        self.state().map(|s| s.executed.clone()).unwrap_or_default()
    }

    pub fn is_locked(&self) -> bool {
        self.state().map(|s| s.lock_holder.is_some()).unwrap_or(false)
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, DbError> {
        self.shared
            .state
            .lock()
            .map_err(|_| DbError::Other("memory database state poisoned".to_string()))
    }
}

/// One instance (session) against a [`MemoryDatabase`].
pub struct MemoryBackend {
    database: MemoryDatabase,
    instance: u64,
    connected: bool,
}

impl MemoryBackend {
    fn store_state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if !self.connected {
            return Err(StoreError::NotConnected);
        }
        Ok(self.database.state()?)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>, LockError> {
        if !self.connected {
            return Err(LockError::NotConnected);
        }
        Ok(self.database.state()?)
    }
}

impl MigrationStore for MemoryBackend {
    fn ensure_migrations(&self) -> Result<(), StoreError> {
        let mut state = self.store_state()?;
        state.table.get_or_insert_with(Vec::new);
        Ok(())
    }

    fn drop_migrations(&self) -> Result<(), StoreError> {
        self.store_state()?.table = None;
        Ok(())
    }

    fn get_migrations(&self, namespace: Option<&str>) -> Result<Vec<MigrationRecord>, StoreError> {
        let state = self.store_state()?;
        let table = state
            .table
            .as_ref()
            .ok_or_else(|| StoreError::TableMissing(TABLE_NAME.to_string()))?;

        let mut records: Vec<MigrationRecord> = table
            .iter()
            .filter(|r| namespace.map_or(true, |ns| r.namespace == ns))
            .cloned()
            .collect();
        // Stable: equal levels keep insertion order
        records.sort_by_key(|r| r.level);
        Ok(records)
    }

    fn find_migration(
        &self,
        namespace: &str,
        level: i64,
    ) -> Result<Option<MigrationRecord>, StoreError> {
        let state = self.store_state()?;
        let table = state
            .table
            .as_ref()
            .ok_or_else(|| StoreError::TableMissing(TABLE_NAME.to_string()))?;

        Ok(table
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
        let mut state = self.store_state()?;
        let table = state
            .table
            .as_mut()
            .ok_or_else(|| StoreError::TableMissing(TABLE_NAME.to_string()))?;

        let exists = table
            .iter()
            .any(|r| r.namespace == record.namespace && r.level == record.level);
        if exists && mode == InsertMode::Unique {
            return Err(StoreError::Duplicate {
                namespace: record.namespace.clone(),
                level: record.level,
            });
        }

        table.push(record.clone());
        Ok(())
    }
}

impl Locker for MemoryBackend {
    fn lock_migrations(&self) -> Result<(), LockError> {
        let mut state = self.lock_state()?;
        loop {
            match state.lock_holder {
                None => {
                    state.lock_holder = Some(self.instance);
                    return Ok(());
                }
                Some(holder) if holder == self.instance => return Err(LockError::AlreadyHeld),
                Some(_) => {
                    state = self
                        .database
                        .shared
                        .lock_released
                        .wait(state)
                        .map_err(|_| DbError::Other("memory database state poisoned".to_string()))?;
                }
            }
        }
    }

    fn unlock_migrations(&self) -> Result<(), LockError> {
        let mut state = self.lock_state()?;
        if state.lock_holder != Some(self.instance) {
            return Err(LockError::NotHeld);
        }
        state.lock_holder = None;
        drop(state);
        self.database.shared.lock_released.notify_all();
        Ok(())
    }
}

impl ScriptExecutor for MemoryBackend {
    fn execute_script(&self, script: &str) -> Result<(), DbError> {
        if !self.connected {
            return Err(DbError::Other("not connected".to_string()));
        }
        validate_script(script)?;
        self.database.state()?.executed.push(script.to_string());
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn connect(&mut self) -> Result<(), StoreError> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), StoreError> {
        if !self.connected {
            return Ok(());
        }
        // Like a closed server session, disconnecting drops any lock held
        let mut state = self.database.state()?;
        if state.lock_holder == Some(self.instance) {
            state.lock_holder = None;
            drop(state);
            self.database.shared.lock_released.notify_all();
        }
        self.connected = false;
        Ok(())
    }
}

/// Accept a script only if every statement starts with a known keyword.
fn validate_script(script: &str) -> Result<(), DbError> {
    for statement in script.split(';') {
        let code: String = statement
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let Some(first) = code.split_whitespace().next() else {
            continue;
        };
        let keyword = first
            .trim_start_matches('(')
            .to_ascii_uppercase();
        if !STATEMENT_KEYWORDS.contains(&keyword.as_str()) {
            return Err(DbError::QueryError(format!("syntax error at or near \"{first}\"")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn connected(database: &MemoryDatabase) -> MemoryBackend {
        let mut backend = database.backend();
        backend.connect().unwrap();
        backend
    }

    fn record(namespace: &str, level: i64, checksum: &str) -> MigrationRecord {
        MigrationRecord {
            level,
            namespace: namespace.to_string(),
            comment: String::new(),
            timestamp: Utc::now(),
            checksum: checksum.to_string(),
            applied_at: Utc::now(),
            execution_time_ms: None,
        }
    }

    #[test]
    fn requires_connection() {
        let database = MemoryDatabase::new();
        let backend = database.backend();
        assert!(matches!(backend.ensure_migrations(), Err(StoreError::NotConnected)));
        assert!(matches!(backend.lock_migrations(), Err(LockError::NotConnected)));
        assert!(backend.execute_script("SELECT 1").is_err());
    }

    #[test]
    fn table_must_exist_before_use() {
        let database = MemoryDatabase::new();
        let backend = connected(&database);
        assert!(matches!(backend.get_migrations(None), Err(StoreError::TableMissing(_))));
        assert!(matches!(
            backend.insert_migration(&record("default", 1, "a"), InsertMode::Unique),
            Err(StoreError::TableMissing(_))
        ));

        backend.ensure_migrations().unwrap();
        backend.ensure_migrations().unwrap();
        assert!(backend.get_migrations(None).unwrap().is_empty());

        backend.drop_migrations().unwrap();
        assert!(matches!(backend.get_migrations(None), Err(StoreError::TableMissing(_))));
    }

    #[test]
    fn orders_by_level_then_insertion_and_filters_namespace() {
        let database = MemoryDatabase::new();
        let backend = connected(&database);
        backend.ensure_migrations().unwrap();
        backend.insert_migration(&record("default", 2, "x"), InsertMode::Unique).unwrap();
        backend.insert_migration(&record("custom", 1, "y"), InsertMode::Unique).unwrap();
        backend.insert_migration(&record("default", 1, "z"), InsertMode::Unique).unwrap();
        backend.insert_migration(&record("default", 1, "z2"), InsertMode::Supersede).unwrap();

        let all: Vec<(String, i64, String)> = backend
            .get_migrations(None)
            .unwrap()
            .into_iter()
            .map(|r| (r.namespace, r.level, r.checksum))
            .collect();
        assert_eq!(
            all,
            [
                ("custom".to_string(), 1, "y".to_string()),
                ("default".to_string(), 1, "z".to_string()),
                ("default".to_string(), 1, "z2".to_string()),
                ("default".to_string(), 2, "x".to_string()),
            ]
        );

        let custom = backend.get_migrations(Some("custom")).unwrap();
        assert_eq!(custom.len(), 1);
        assert_eq!(backend.find_migration("default", 1).unwrap().unwrap().checksum, "z2");
        assert!(backend.find_migration("custom", 2).unwrap().is_none());
    }

    #[test]
    fn unique_insert_rejects_duplicates() {
        let database = MemoryDatabase::new();
        let backend = connected(&database);
        backend.ensure_migrations().unwrap();
        backend.insert_migration(&record("default", 1, "a"), InsertMode::Unique).unwrap();
        let err = backend
            .insert_migration(&record("default", 1, "b"), InsertMode::Unique)
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { level: 1, .. }));
        // Same level, other namespace is fine
        backend.insert_migration(&record("other", 1, "a"), InsertMode::Unique).unwrap();
    }

    #[test]
    fn lock_is_exclusive_across_instances() {
        let database = MemoryDatabase::new();
        let first = connected(&database);
        let second = connected(&database);

        first.lock_migrations().unwrap();
        assert!(database.is_locked());
        assert!(matches!(first.lock_migrations(), Err(LockError::AlreadyHeld)));
        assert!(matches!(second.unlock_migrations(), Err(LockError::NotHeld)));

        let hold = Duration::from_millis(150);
        let start = Instant::now();
        let holder = thread::spawn(move || {
            thread::sleep(hold);
            first.unlock_migrations().unwrap();
        });

        second.lock_migrations().unwrap();
        let waited = start.elapsed();
        holder.join().unwrap();

        assert!(waited >= hold, "acquired after {waited:?}, before release");
        second.unlock_migrations().unwrap();
        assert!(!database.is_locked());
    }

    #[test]
    fn disconnect_releases_held_lock() {
        let database = MemoryDatabase::new();
        let mut first = connected(&database);
        let second = connected(&database);

        first.lock_migrations().unwrap();
        first.disconnect().unwrap();

        second.lock_migrations().unwrap();
        second.unlock_migrations().unwrap();
    }

    #[test]
    fn simulated_execution_accepts_sql_and_rejects_garbage() {
        assert!(
            validate_script("CREATE TABLE foo (id INTEGER); insert into foo values (1);").is_ok()
        );
        assert!(validate_script("-- leading comment\nSELECT 1;\n\n").is_ok());
        assert!(validate_script("").is_ok());

        let err = validate_script("INVALID").unwrap_err();
        assert!(err.to_string().contains("INVALID"));
        assert!(validate_script("SELECT 1; FROBNICATE foo").is_err());
    }

    #[test]
    fn failed_script_is_not_logged_as_executed() {
        let database = MemoryDatabase::new();
        let backend = connected(&database);
        backend.execute_script("SELECT 1").unwrap();
        assert!(backend.execute_script("SELECT 1; nope").is_err());
        assert_eq!(database.executed_scripts(), ["SELECT 1"]);
    }
}
