//! Core Transactional Executor Traits
//!
//! The engine only needs one capability from a database: run arbitrary
//! statements and ledger writes inside a single transaction that either
//! commits as a whole or leaves nothing behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::definitions::LedgerEntry;
use crate::error::MigrationResult;

/// A database the engine can migrate
#[async_trait]
pub trait TransactionalExecutor: Send + Sync {
    /// Create the ledger table and its indexes if they do not exist
    async fn ensure_ledger(&self, table: &str) -> MigrationResult<()>;

    /// Read every ledger row, ordered by `applied_at`
    async fn fetch_ledger(&self, table: &str) -> MigrationResult<Vec<LedgerEntry>>;

    /// Begin a migration transaction
    async fn begin(&self) -> MigrationResult<Box<dyn MigrationTransaction>>;

    /// Backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// A transaction carrying one unit's schema change and its ledger write
#[async_trait]
pub trait MigrationTransaction: Send {
    /// Execute one statement, returning affected rows
    async fn execute(&mut self, sql: &str) -> MigrationResult<u64>;

    /// Insert the row, or update it in place and clear `rolled_back_at`
    async fn upsert_ledger_entry(&mut self, table: &str, entry: &LedgerEntry) -> MigrationResult<()>;

    /// Set `rolled_back_at` on an existing row
    async fn mark_rolled_back(
        &mut self,
        table: &str,
        id: &str,
        rolled_back_at: DateTime<Utc>,
    ) -> MigrationResult<()>;

    async fn savepoint(&mut self, name: &str) -> MigrationResult<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> MigrationResult<()>;

    async fn release_savepoint(&mut self, name: &str) -> MigrationResult<()>;

    async fn commit(self: Box<Self>) -> MigrationResult<()>;

    async fn rollback(self: Box<Self>) -> MigrationResult<()>;
}
