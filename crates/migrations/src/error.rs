//! Error types for the migration engine
//!
//! Load errors are isolated per unit, planning errors reject the whole plan,
//! execution errors are carried inside a unit result. Only failures that
//! prevent the engine from working at all (unreachable database, unreadable
//! migrations directory) surface as hard errors from the public API.

use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Error types for migration operations
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A single unit's files are missing or malformed
    #[error("Failed to load migration '{migration}': {reason}")]
    Load { migration: String, reason: String },

    /// Loaded units depend on each other in a cycle
    #[error("Circular migration dependency: {cycle}")]
    CyclicDependency { cycle: String },

    /// A forward plan needs a unit that is neither active nor scheduled earlier
    #[error("Migration '{migration}' depends on '{dependency}', which is not applied and not scheduled before it")]
    DependencyUnsatisfied { migration: String, dependency: String },

    /// A backward plan would reverse a unit that something active still needs
    #[error("Cannot roll back '{migration}': '{dependent}' depends on it and would remain applied")]
    RollbackBlocked { migration: String, dependent: String },

    /// The unit has no rollback script
    #[error("Migration '{migration}' has no rollback script")]
    NotReversible { migration: String },

    /// The ledger knows a unit the loader cannot find
    #[error("Migration '{migration}' is recorded in the ledger but its files were not loaded")]
    MissingMigration { migration: String },

    /// A unit failed while running its script or writing the ledger
    #[error("Migration '{migration}' failed: {message}")]
    Execution {
        migration: String,
        message: String,
        code: Option<String>,
    },

    /// Database connection or query error
    #[error("Database error: {message}{}", sqlstate_suffix(.code))]
    Database { message: String, code: Option<String> },

    /// Transaction lifecycle error
    #[error("Transaction error: {message}{}", sqlstate_suffix(.code))]
    Transaction { message: String, code: Option<String> },

    /// Authoring-time validation failure
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

fn sqlstate_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|code| format!(" (SQLSTATE {})", code))
        .unwrap_or_default()
}

fn sqlstate_of(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Database {
            code: sqlstate_of(&err),
            message: err.to_string(),
        }
    }
}

impl MigrationError {
    pub fn database(message: impl Into<String>) -> Self {
        MigrationError::Database {
            message: message.into(),
            code: None,
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        MigrationError::Transaction {
            message: message.into(),
            code: None,
        }
    }

    /// Database error with context, keeping the driver's SQLSTATE
    pub(crate) fn database_context(context: &str, err: sqlx::Error) -> Self {
        MigrationError::Database {
            code: sqlstate_of(&err),
            message: format!("{}: {}", context, err),
        }
    }

    /// Transaction error with context, keeping the driver's SQLSTATE
    pub(crate) fn transaction_context(context: &str, err: sqlx::Error) -> Self {
        MigrationError::Transaction {
            code: sqlstate_of(&err),
            message: format!("{}: {}", context, err),
        }
    }

    /// SQLSTATE reported by the database, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            MigrationError::Database { code, .. }
            | MigrationError::Transaction { code, .. }
            | MigrationError::Execution { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Whether this error rejects a plan before anything runs
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            MigrationError::DependencyUnsatisfied { .. }
                | MigrationError::RollbackBlocked { .. }
                | MigrationError::NotReversible { .. }
                | MigrationError::MissingMigration { .. }
        )
    }
}

/// Check whether an error is a transient conflict that is safe to retry.
///
/// Only the SQLSTATE decides; message text can echo identifiers from the
/// failing statement. The whole transaction is rolled back before a retry,
/// so nothing from the failed attempt is left behind.
pub fn is_transient_failure(error: &MigrationError) -> bool {
    matches!(
        error.sqlstate(),
        Some(
            "40001" // serialization_failure
                | "40P01" // deadlock_detected
                | "55P03" // lock_not_available
        )
    )
}
