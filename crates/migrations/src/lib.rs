//! # elif-migrations: Reversible Schema Migrations for elif.rs
//!
//! Versioned, bidirectional schema changes with dependency ordering,
//! checksum-based drift detection and one transaction per unit.
//!
//! Each unit lives in its own directory (`migration.json`, `migration.sql`,
//! `rollback.sql`). The [`Migrator`] loads them, consults the ledger table in
//! the target database, plans what to apply or reverse and runs the plan one
//! unit at a time, stopping at the first failure.
//!
//! ```no_run
//! use std::sync::Arc;
//! use elif_migrations::{MigrationConfig, Migrator, PostgresExecutor};
//!
//! # async fn run() -> elif_migrations::MigrationResult<()> {
//! let config = MigrationConfig::from_env()?;
//! let executor = PostgresExecutor::connect("postgresql://localhost/app", &config).await?;
//! let migrator = Migrator::new(config, Arc::new(executor));
//!
//! migrator.initialize().await?;
//! let execution = migrator.migrate(None, false).await?;
//! assert!(execution.success());
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod checksum;
pub mod config;
pub mod definitions;
pub mod error;
pub mod executor;
pub mod graph;
pub mod integrity;
pub mod ledger;
pub mod loader;
pub mod migrator;
pub mod planner;
pub mod rollback;
pub mod runner;
pub mod validation;

pub use backends::{MemoryExecutor, MigrationTransaction, PostgresExecutor, TransactionalExecutor};
pub use checksum::compute_checksum;
pub use config::{ConfigError, MigrationConfig};
pub use definitions::*;
pub use error::{is_transient_failure, MigrationError, MigrationResult};
pub use executor::UnitExecutor;
pub use graph::DependencyGraph;
pub use integrity::validate_integrity;
pub use ledger::Ledger;
pub use loader::{split_sql_statements, MigrationLoader};
pub use migrator::Migrator;
pub use planner::Planner;
pub use rollback::MigrationRollback;
pub use runner::PlanRunner;
pub use validation::ScriptValidator;
