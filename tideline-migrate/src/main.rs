//! Tideline Migration CLI Tool
//!
//! Command-line interface over the Tideline migration engine. Safe to run from
//! several CI jobs or replicas at once: every script is applied under the
//! migration lock and recorded exactly once.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process;
use tideline::config::LockStrategy;
use tideline::migration::{
    discover_migrations, Driver, MigrationFile, MigrationStatus, PostgresBackend, RunOutcome,
    DEFAULT_NAMESPACE,
};
use tideline::TidelineConfig;

#[derive(Parser)]
#[command(name = "tideline-migrate")]
#[command(about = "Migration management tool for Tideline")]
#[command(version = "0.1.0")]
struct Cli {
    /// Database connection URL (falls back to TIDELINE_DATABASE_URL, then DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Namespace the migrations belong to
    #[arg(long, global = true, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Lock implementation: advisory or table
    #[arg(long, global = true)]
    lock_strategy: Option<LockStrategy>,

    /// History table name
    #[arg(long, global = true)]
    table: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the history table if it does not exist
    Ensure,

    /// Show applied, pending and drifted migrations
    Status {
        /// Migrations directory path
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply pending migrations
    Up {
        /// Migrations directory path
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,

        /// Dry run - show what would be executed without running
        #[arg(long)]
        dry_run: bool,
    },

    /// Fail if any applied migration file has changed since it was applied
    Verify {
        /// Migrations directory path
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,
    },

    /// Drop the history table (and the lock table, if any)
    Drop {
        /// Confirm the destructive operation
        #[arg(long)]
        yes: bool,
    },
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let quiet = cli.quiet;
    match run(cli) {
        Ok(()) => {
            if !quiet {
                println!("{}", "Success".green());
            }
        }
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;
    let backend = PostgresBackend::from_config(&config)?;
    let mut driver = Driver::new(backend).with_options(config.engine.runner_options());
    driver.connect().context("connecting to database")?;

    let result = match &cli.command {
        Commands::Ensure => handle_ensure(&driver),
        Commands::Status { dir, json } => handle_status(&driver, &cli.namespace, dir, *json),
        Commands::Up { dir, dry_run } => handle_up(&driver, &cli.namespace, dir, *dry_run),
        Commands::Verify { dir } => handle_verify(&driver, &cli.namespace, dir),
        Commands::Drop { yes } => handle_drop(&driver, *yes),
    };

    if let Err(e) = driver.disconnect() {
        log::warn!("disconnect failed: {e}");
    }
    result
}

/// File/env configuration with command-line flags on top.
fn resolve_config(cli: &Cli) -> Result<TidelineConfig> {
    let mut config = TidelineConfig::load().context("loading configuration")?;

    if let Some(url) = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("TIDELINE_DATABASE_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
    {
        config.database.url = url;
    }
    if let Some(strategy) = cli.lock_strategy {
        config.engine.lock_strategy = strategy;
    }
    if let Some(table) = &cli.table {
        config.engine.table = table.clone();
    }
    Ok(config)
}

fn load_files(dir: &Path, namespace: &str) -> Result<Vec<MigrationFile>> {
    discover_migrations(dir, namespace)
        .with_context(|| format!("reading migrations from {}", dir.display()))
}

fn handle_ensure(driver: &Driver<PostgresBackend>) -> Result<()> {
    driver.ensure_migrations()?;
    println!("History table '{}' is ready", driver.backend().table());
    Ok(())
}

fn handle_status(
    driver: &Driver<PostgresBackend>,
    namespace: &str,
    dir: &Path,
    json: bool,
) -> Result<()> {
    // A missing directory just means nothing is pending
    let files = if dir.exists() { load_files(dir, namespace)? } else { Vec::new() };
    let status = driver.status(namespace, &files)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_status(namespace, &status);
    Ok(())
}

fn print_status(namespace: &str, status: &MigrationStatus) {
    println!("\n{} {}\n", "Migration Status for namespace".bold(), namespace.bold());

    if status.applied.is_empty() {
        println!("Applied Migrations: None");
    } else {
        println!("Applied Migrations ({}):", status.applied_count());
        for record in &status.applied {
            let time_str = record
                .execution_time_ms
                .map_or_else(|| "N/A".to_string(), |ms| format!("{ms}ms"));
            println!(
                "  {} {}.{} ({}, {})",
                "✓".green(),
                record.level,
                record.comment,
                record.applied_at.format("%Y-%m-%d %H:%M:%S"),
                time_str
            );
        }
    }

    println!();

    if status.pending.is_empty() {
        println!("Pending Migrations: None");
    } else {
        println!("Pending Migrations ({}):", status.pending_count());
        for pending in &status.pending {
            let kind = if pending.repeatable { "repeatable" } else { "pending" };
            println!("  {} {}.{} ({kind})", "•".yellow(), pending.level, pending.comment);
        }
    }

    if !status.drifted.is_empty() {
        println!("\nDrifted Migrations ({}):", status.drifted.len());
        for drifted in &status.drifted {
            println!(
                "  {} {} changed since it was applied",
                "✗".red(),
                drifted.path.display()
            );
        }
    }

    println!(
        "\nSummary: {} applied, {} pending, {} drifted",
        status.applied_count(),
        status.pending_count(),
        status.drifted.len()
    );
}

fn handle_up(
    driver: &Driver<PostgresBackend>,
    namespace: &str,
    dir: &Path,
    dry_run: bool,
) -> Result<()> {
    let files = load_files(dir, namespace)?;

    if dry_run {
        let status = driver.status(namespace, &files)?;
        if status.pending.is_empty() && status.drifted.is_empty() {
            println!("No pending migrations to apply");
            return Ok(());
        }
        println!("Would apply:");
        for pending in &status.pending {
            println!("  {}.{}", pending.level, pending.comment);
        }
        for drifted in &status.drifted {
            println!("  {} (changed, subject to drift policy)", drifted.path.display());
        }
        return Ok(());
    }

    let mut executed = 0;
    for file in &files {
        let outcome = driver
            .run_migration(&file.to_migration())
            .with_context(|| format!("applying {}", file.path.display()))?;
        let label = match &outcome {
            RunOutcome::Applied(_) => "applied".green(),
            RunOutcome::Reapplied(_) => "re-applied".yellow(),
            RunOutcome::Executed => "executed (not recorded)".green(),
            RunOutcome::AlreadyApplied(_) => "up to date".dimmed(),
            RunOutcome::Skipped => "skipped".dimmed(),
        };
        println!("  {}.{}: {label}", file.level, file.comment);
        if outcome.executed() {
            executed += 1;
        }
    }

    println!("Executed {executed} migration(s)");
    Ok(())
}

fn handle_verify(driver: &Driver<PostgresBackend>, namespace: &str, dir: &Path) -> Result<()> {
    let files = load_files(dir, namespace)?;
    let status = driver.status(namespace, &files)?;

    if !status.drifted.is_empty() {
        for drifted in &status.drifted {
            eprintln!(
                "{} level {}: stored {} current {}",
                drifted.path.display(),
                drifted.level,
                drifted.stored_checksum,
                drifted.current_checksum
            );
        }
        bail!("{} migration(s) changed after being applied", status.drifted.len());
    }

    println!("All {} applied migration(s) match their files", status.applied_count());
    Ok(())
}

fn handle_drop(driver: &Driver<PostgresBackend>, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to drop migration history without --yes");
    }
    driver.drop_migrations()?;
    println!("Dropped history table '{}'", driver.backend().table());
    Ok(())
}
