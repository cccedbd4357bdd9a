//! Migration configuration
//!
//! Defaults can be overridden programmatically with the `with_*` builders or
//! from environment variables via [`MigrationConfig::from_env`].

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Validation failed for {field}: {reason}")]
    ValidationFailed { field: String, reason: String },
}

/// Statements flagged as destructive by default. Matching is case-insensitive.
const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"\bDROP\s+TABLE\b",
    r"\bDROP\s+(DATABASE|SCHEMA)\b",
    r"\bTRUNCATE\b",
    r"^\s*DELETE\s+FROM\s+[\w.\x22]+\s*;?\s*$",
];

/// Statements that are worth a second look but are routinely fine.
const DEFAULT_CAUTION_PATTERNS: &[&str] = &[
    r"\bDROP\s+COLUMN\b",
    r"\bALTER\s+COLUMN\s+[\w\x22]+\s+(SET\s+DATA\s+)?TYPE\b",
    r"\bDROP\s+INDEX\b",
];

/// Configuration for the migration system
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory holding one subdirectory per migration unit
    pub migrations_dir: PathBuf,
    /// Ledger table name
    pub ledger_table: String,
    /// Patterns reported as "potentially destructive statement" warnings
    pub deny_patterns: Vec<String>,
    /// Patterns reported as "statement requires review" warnings
    pub caution_patterns: Vec<String>,
    /// Lock acquisition wait per migration transaction, 0 disables
    pub lock_timeout_ms: u64,
    /// Statement time limit per migration transaction, 0 disables
    pub statement_timeout_ms: u64,
    /// Retries of a whole transaction after a transient conflict
    pub max_retries: u32,
    /// Base delay between retries, multiplied by the attempt number
    pub retry_backoff_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            ledger_table: "elif_schema_migrations".to_string(),
            deny_patterns: DEFAULT_DENY_PATTERNS.iter().map(|p| p.to_string()).collect(),
            caution_patterns: DEFAULT_CAUTION_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            lock_timeout_ms: 10_000,
            statement_timeout_ms: 0,
            max_retries: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl MigrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    pub fn with_ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger_table = table.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff_ms(mut self, backoff: u64) -> Self {
        self.retry_backoff_ms = backoff;
        self
    }

    pub fn with_lock_timeout_ms(mut self, timeout: u64) -> Self {
        self.lock_timeout_ms = timeout;
        self
    }

    pub fn with_statement_timeout_ms(mut self, timeout: u64) -> Self {
        self.statement_timeout_ms = timeout;
        self
    }

    /// Add a pattern to the destructive-statement list
    pub fn deny(mut self, pattern: impl Into<String>) -> Self {
        self.deny_patterns.push(pattern.into());
        self
    }

    /// Add a pattern to the caution list
    pub fn caution(mut self, pattern: impl Into<String>) -> Self {
        self.caution_patterns.push(pattern.into());
        self
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(dir) = env::var("MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }

        if let Ok(table) = env::var("MIGRATIONS_TABLE") {
            config.ledger_table = table;
        }

        if let Some(timeout) = parse_env("MIGRATION_LOCK_TIMEOUT_MS", "milliseconds")? {
            config.lock_timeout_ms = timeout;
        }

        if let Some(timeout) = parse_env("MIGRATION_STATEMENT_TIMEOUT_MS", "milliseconds")? {
            config.statement_timeout_ms = timeout;
        }

        if let Some(retries) = parse_env("MIGRATION_MAX_RETRIES", "non-negative integer")? {
            config.max_retries = retries;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_sql_identifier(&self.ledger_table) {
            return Err(ConfigError::InvalidValue {
                field: "ledger_table".to_string(),
                value: self.ledger_table.clone(),
                expected: "a SQL identifier ([A-Za-z_][A-Za-z0-9_]*, optionally schema-qualified)"
                    .to_string(),
            });
        }

        for pattern in self.deny_patterns.iter().chain(&self.caution_patterns) {
            if let Err(e) = crate::validation::compile_pattern(pattern) {
                return Err(ConfigError::ValidationFailed {
                    field: "patterns".to_string(),
                    reason: format!("'{}': {}", pattern, e),
                });
            }
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(var: &str, expected: &str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: var.to_string(),
                value: raw,
                expected: expected.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
