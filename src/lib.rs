//! # Tideline
//!
//! Exactly-once, lock-coordinated SQL migrations for PostgreSQL on the `may` runtime.
//!
//! Every replica of a service can call [`migration::startup_migrations`] at boot:
//! the migration lock serializes them, each script is applied once per
//! `(namespace, level)`, and every application is recorded in a history table.
//! [`compliance::ComplianceSuite`] verifies any backend against the driver contract.

pub mod compliance;
pub mod config;
pub mod connection;
pub mod executor;
pub mod metrics;
pub mod migration;

pub use config::TidelineConfig;
pub use connection::connect;
pub use executor::{DbError, Executor, MayPostgresExecutor};
