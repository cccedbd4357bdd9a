//! Ledger - persistent record of applied and rolled back units
//!
//! Reads go straight to the database on every call. Writes take the open
//! migration transaction so the ledger and the schema never disagree.

use std::sync::Arc;

use chrono::Utc;

use crate::backends::{MigrationTransaction, TransactionalExecutor};
use crate::definitions::{LedgerEntry, MigrationUnit};
use crate::error::MigrationResult;

/// State store backed by a table in the target database
#[derive(Clone)]
pub struct Ledger {
    executor: Arc<dyn TransactionalExecutor>,
    table: String,
}

impl Ledger {
    pub fn new(executor: Arc<dyn TransactionalExecutor>, table: impl Into<String>) -> Self {
        Self {
            executor,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger table if needed
    pub async fn initialize(&self) -> MigrationResult<()> {
        self.executor.ensure_ledger(&self.table).await?;
        tracing::debug!(
            "Ledger table {} ready on {}",
            self.table,
            self.executor.backend_name()
        );
        Ok(())
    }

    /// All rows, including rolled back ones, ordered by `applied_at`
    pub async fn get_applied(&self) -> MigrationResult<Vec<LedgerEntry>> {
        self.executor.fetch_ledger(&self.table).await
    }

    /// Active rows only
    pub async fn get_active(&self) -> MigrationResult<Vec<LedgerEntry>> {
        Ok(self
            .get_applied()
            .await?
            .into_iter()
            .filter(LedgerEntry::is_active)
            .collect())
    }

    /// Rows ordered most recent first, at most `limit`
    pub async fn history(&self, limit: usize) -> MigrationResult<Vec<LedgerEntry>> {
        let mut entries = self.get_applied().await?;
        entries.sort_by(|a, b| b.applied_at.cmp(&a.applied_at).then_with(|| b.version.cmp(&a.version)));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Upsert the row for `unit` and clear `rolled_back_at`
    pub async fn record_applied(
        &self,
        tx: &mut dyn MigrationTransaction,
        unit: &MigrationUnit,
        execution_time_ms: u64,
    ) -> MigrationResult<LedgerEntry> {
        let entry = LedgerEntry::applied(
            unit,
            Utc::now(),
            i64::try_from(execution_time_ms).unwrap_or(i64::MAX),
        );
        tx.upsert_ledger_entry(&self.table, &entry).await?;
        Ok(entry)
    }

    /// Set `rolled_back_at = now` on the row for `unit`
    pub async fn record_rolled_back(
        &self,
        tx: &mut dyn MigrationTransaction,
        unit: &MigrationUnit,
    ) -> MigrationResult<()> {
        tx.mark_rolled_back(&self.table, &unit.id, Utc::now()).await
    }
}
