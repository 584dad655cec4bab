//! Black-box compliance checks for migration backends
//!
//! [`ComplianceSuite::run`] drives any [`Backend`] through the driver contract:
//! idempotent and concurrent history creation, cross-instance locking, exactly-once
//! application and recording, repeatable scripts, namespace isolation and failure
//! reporting. Every check gets two fresh driver instances from the factory, both
//! connected, with the history dropped beforehand, so checks are independent.
//!
//! ```
//! use tideline::compliance::ComplianceSuite;
//! use tideline::migration::{Driver, MemoryDatabase};
//!
//! let database = MemoryDatabase::new();
//! let report = ComplianceSuite::new().run(|| Ok(Driver::new(database.backend())));
//! assert!(report.passed(), "{report}");
//! ```

use crate::migration::{Backend, Directives, Driver, Migration, MigrationError};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

const LOCK_HOLD: Duration = Duration::from_millis(200);
const LOCK_WAIT_MIN: Duration = Duration::from_millis(199);
const LOCK_WAIT_MAX: Duration = Duration::from_millis(400);

/// Migrations the checks submit.
#[derive(Debug, Clone)]
pub struct Fixtures {
    /// Level 1 in the default namespace
    pub simple: Migration,
    /// Level 1 in a non-default namespace
    pub namespace: Migration,
    /// Level 5 whose script the database must reject
    pub fail: Migration,
}

impl Default for Fixtures {
    fn default() -> Self {
        let timestamp = Utc
            .with_ymd_and_hms(2016, 12, 1, 15, 14, 13)
            .single()
            .unwrap_or_else(Utc::now);

        Self {
            simple: Migration::new(1, "CREATE TABLE IF NOT EXISTS compliance_simple (id INTEGER)")
                .with_comment("test migration")
                .with_timestamp(timestamp),
            namespace: Migration::new(
                1,
                "CREATE TABLE IF NOT EXISTS compliance_namespace (id INTEGER)",
            )
            .with_namespace("so-special")
            .with_comment("test migration")
            .with_timestamp(timestamp),
            fail: Migration::new(5, "INVALID")
                .with_comment("failing migration")
                .with_timestamp(timestamp),
        }
    }
}

/// Outcome of one named check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: &'static str,
    pub outcome: Result<(), String>,
}

#[derive(Debug, Clone, Default)]
pub struct ComplianceReport {
    pub results: Vec<CheckResult>,
}

impl ComplianceReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| r.outcome.is_err())
    }
}

impl fmt::Display for ComplianceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            match &result.outcome {
                Ok(()) => writeln!(f, "ok      {}", result.name)?,
                Err(reason) => writeln!(f, "FAILED  {}: {reason}", result.name)?,
            }
        }
        let failed = self.failures().count();
        write!(f, "{} passed, {failed} failed", self.results.len() - failed)
    }
}

type Check<B> = fn(&Fixtures, &mut Driver<B>, &mut Driver<B>) -> Result<(), String>;

#[derive(Debug, Clone, Default)]
pub struct ComplianceSuite {
    fixtures: Fixtures,
}

impl ComplianceSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixtures(fixtures: Fixtures) -> Self {
        Self { fixtures }
    }

    /// Run every check. `factory` must return a new, unconnected instance on each
    /// call, all pointing at the same database.
    pub fn run<B, F>(&self, factory: F) -> ComplianceReport
    where
        B: Backend + Send + Sync,
        F: Fn() -> Result<Driver<B>, MigrationError>,
    {
        let checks: [(&'static str, Check<B>); 9] = [
            ("should create migration table if not exists", create_if_not_exists),
            ("should create migration table in parallel", create_in_parallel),
            ("should not fail if migration table already exists", ensure_twice),
            ("should lock migrations table", lock_migrations),
            ("should run migration", run_migration),
            ("should rerun repeatable migration", rerun_repeatable),
            ("should record namespace", record_namespace),
            ("should isolate by namespace", isolate_by_namespace),
            ("should report migration errors", report_errors),
        ];

        let results = checks
            .into_iter()
            .map(|(name, check)| {
                let outcome = self.run_check(&factory, check);
                match &outcome {
                    Ok(()) => log::debug!("compliance check passed: {name}"),
                    Err(reason) => log::warn!("compliance check failed: {name}: {reason}"),
                }
                CheckResult { name, outcome }
            })
            .collect();

        ComplianceReport { results }
    }

    fn run_check<B, F>(&self, factory: &F, check: Check<B>) -> Result<(), String>
    where
        B: Backend,
        F: Fn() -> Result<Driver<B>, MigrationError>,
    {
        let mut first = factory().map_err(|e| format!("factory: {e}"))?;
        let mut second = factory().map_err(|e| format!("factory: {e}"))?;
        first.connect().map_err(|e| format!("connect: {e}"))?;
        second.connect().map_err(|e| format!("connect: {e}"))?;

        let outcome = first
            .drop_migrations()
            .map_err(|e| format!("drop_migrations: {e}"))
            .and_then(|()| check(&self.fixtures, &mut first, &mut second));

        // Always close both sessions; the check's own error wins
        let closed = first
            .disconnect()
            .and(second.disconnect())
            .map_err(|e| format!("disconnect: {e}"));
        outcome.and(closed)
    }
}

fn step<T, E: fmt::Display>(what: &str, result: Result<T, E>) -> Result<T, String> {
    result.map_err(|e| format!("{what}: {e}"))
}

fn expect_eq<T: PartialEq + fmt::Debug>(what: &str, actual: T, expected: T) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("{what}: expected {expected:?}, got {actual:?}"))
    }
}

fn iso(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn create_if_not_exists<B: Backend>(
    _: &Fixtures,
    d1: &mut Driver<B>,
    _: &mut Driver<B>,
) -> Result<(), String> {
    step("ensure_migrations", d1.ensure_migrations())?;
    let records = step("get_migrations", d1.get_migrations(None))?;
    expect_eq("record count", records.len(), 0)
}

fn create_in_parallel<B: Backend + Send + Sync>(
    _: &Fixtures,
    d1: &mut Driver<B>,
    d2: &mut Driver<B>,
) -> Result<(), String> {
    let (d1, d2) = (&*d1, &*d2);
    let (r1, r2) = thread::scope(|s| {
        let h1 = s.spawn(|| d1.ensure_migrations().map_err(|e| e.to_string()));
        let h2 = s.spawn(|| d2.ensure_migrations().map_err(|e| e.to_string()));
        (
            h1.join().unwrap_or_else(|_| Err("ensure thread panicked".to_string())),
            h2.join().unwrap_or_else(|_| Err("ensure thread panicked".to_string())),
        )
    });
    step("first ensure_migrations", r1)?;
    step("second ensure_migrations", r2)?;

    let records = step("get_migrations", d1.get_migrations(None))?;
    expect_eq("record count", records.len(), 0)
}

fn ensure_twice<B: Backend>(
    _: &Fixtures,
    d1: &mut Driver<B>,
    _: &mut Driver<B>,
) -> Result<(), String> {
    step("first ensure_migrations", d1.ensure_migrations())?;
    step("second ensure_migrations", d1.ensure_migrations())
}

fn lock_migrations<B: Backend + Send + Sync>(
    _: &Fixtures,
    d1: &mut Driver<B>,
    d2: &mut Driver<B>,
) -> Result<(), String> {
    let (d1, d2) = (&*d1, &*d2);
    step("ensure_migrations", d1.ensure_migrations())?;
    step("first lock_migrations", d1.lock_migrations())?;

    let start = Instant::now();
    let (released, waited) = thread::scope(|s| {
        let holder = s.spawn(|| {
            thread::sleep(LOCK_HOLD);
            d1.unlock_migrations().map_err(|e| e.to_string())
        });

        let acquired = d2
            .lock_migrations()
            .map(|()| start.elapsed())
            .map_err(|e| e.to_string());
        let released = holder
            .join()
            .unwrap_or_else(|_| Err("holder thread panicked".to_string()));
        (released, acquired)
    });
    step("first unlock_migrations", released)?;
    let waited = step("second lock_migrations", waited)?;
    step("second unlock_migrations", d2.unlock_migrations())?;

    if waited < LOCK_WAIT_MIN || waited > LOCK_WAIT_MAX {
        return Err(format!(
            "second instance acquired the lock after {waited:?}, \
             expected {LOCK_WAIT_MIN:?}..={LOCK_WAIT_MAX:?}"
        ));
    }
    Ok(())
}

fn run_migration<B: Backend>(
    fx: &Fixtures,
    d1: &mut Driver<B>,
    _: &mut Driver<B>,
) -> Result<(), String> {
    let migration = &fx.simple;
    step("ensure_migrations", d1.ensure_migrations())?;
    step("run_migration", d1.run_migration(migration))?;

    let records = step("get_migrations", d1.get_migrations(None))?;
    expect_eq("record count", records.len(), 1)?;
    let record = &records[0];
    expect_eq("level", record.level, migration.level())?;
    expect_eq("comment", record.comment.as_str(), migration.comment())?;
    expect_eq("timestamp", iso(record.timestamp), iso(migration.timestamp()))?;
    expect_eq("checksum", record.checksum.as_str(), migration.checksum())
}

fn rerun_repeatable<B: Backend>(
    fx: &Fixtures,
    d1: &mut Driver<B>,
    _: &mut Driver<B>,
) -> Result<(), String> {
    let repeatable = Migration::new(fx.simple.level(), fx.simple.script())
        .with_directives(Directives::default().audit(false));

    step("ensure_migrations", d1.ensure_migrations())?;
    step("first run_migration", d1.run_migration(&repeatable))?;
    step("second run_migration", d1.run_migration(&repeatable))?;

    let records = step("get_migrations", d1.get_migrations(None))?;
    expect_eq("record count", records.len(), 0)
}

fn record_namespace<B: Backend>(
    fx: &Fixtures,
    d1: &mut Driver<B>,
    _: &mut Driver<B>,
) -> Result<(), String> {
    let migration = &fx.namespace;
    step("ensure_migrations", d1.ensure_migrations())?;
    step("run_migration", d1.run_migration(migration))?;

    let records = step("get_migrations", d1.get_migrations(None))?;
    expect_eq("record count", records.len(), 1)?;
    let record = &records[0];
    expect_eq("level", record.level, migration.level())?;
    expect_eq("comment", record.comment.as_str(), migration.comment())?;
    expect_eq("timestamp", iso(record.timestamp), iso(migration.timestamp()))?;
    expect_eq("checksum", record.checksum.as_str(), migration.checksum())?;
    expect_eq("namespace", record.namespace.as_str(), migration.namespace())
}

fn isolate_by_namespace<B: Backend>(
    fx: &Fixtures,
    d1: &mut Driver<B>,
    _: &mut Driver<B>,
) -> Result<(), String> {
    step("ensure_migrations", d1.ensure_migrations())?;
    step("run_migration (default)", d1.run_migration(&fx.simple))?;
    step("run_migration (namespaced)", d1.run_migration(&fx.namespace))?;

    let records = step("get_migrations", d1.get_migrations(None))?;
    expect_eq("record count", records.len(), 2)?;
    expect_eq("first namespace", records[0].namespace.as_str(), fx.simple.namespace())?;
    expect_eq("second namespace", records[1].namespace.as_str(), fx.namespace.namespace())
}

fn report_errors<B: Backend>(
    fx: &Fixtures,
    d1: &mut Driver<B>,
    _: &mut Driver<B>,
) -> Result<(), String> {
    step("ensure_migrations", d1.ensure_migrations())?;

    let err = match d1.run_migration(&fx.fail) {
        Ok(outcome) => return Err(format!("failing script succeeded with {outcome:?}")),
        Err(err) => err,
    };
    let failed = err
        .migration()
        .ok_or_else(|| format!("error does not identify the migration: {err}"))?;
    expect_eq("failed level", failed.level, fx.fail.level())?;
    expect_eq("failed script", failed.script.as_str(), fx.fail.script())?;

    let records = step("get_migrations", d1.get_migrations(None))?;
    expect_eq("record count", records.len(), 0)
}
