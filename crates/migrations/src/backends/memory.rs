//! In-memory backend
//!
//! Keeps the ledger and a log of executed statements in process memory.
//! Transactions work on a private copy of the state that replaces the
//! shared state on commit, so a failed unit leaves nothing behind. Failure
//! injection makes it possible to exercise the engine's error paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::core::{MigrationTransaction, TransactionalExecutor};
use crate::definitions::LedgerEntry;
use crate::error::{MigrationError, MigrationResult};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    ledger_tables: Vec<String>,
    ledger: BTreeMap<String, LedgerEntry>,
    statements: Vec<String>,
}

#[derive(Debug, Clone)]
struct FailureRule {
    pattern: String,
    message: String,
    code: Option<String>,
    /// `None` fails every time
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    state: MemoryState,
    rules: Vec<FailureRule>,
    fail_ledger_writes: bool,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory transactional executor
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    inner: Arc<Mutex<Inner>>,
    transactions: Arc<AtomicU64>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement containing `pattern`
    pub fn fail_on(&self, pattern: impl Into<String>) -> &Self {
        let pattern = pattern.into();
        lock(&self.inner).rules.push(FailureRule {
            message: format!("statement matching '{}' rejected", pattern),
            code: None,
            pattern,
            remaining: None,
        });
        self
    }

    /// Fail the next `times` statements containing `pattern` with a
    /// serialization failure, then let them through
    pub fn fail_transiently(&self, pattern: impl Into<String>, times: u32) -> &Self {
        lock(&self.inner).rules.push(FailureRule {
            pattern: pattern.into(),
            message: "could not serialize access due to concurrent update".to_string(),
            code: Some("40001".to_string()),
            remaining: Some(times),
        });
        self
    }

    /// Make every ledger write fail
    pub fn fail_ledger_writes(&self, fail: bool) -> &Self {
        lock(&self.inner).fail_ledger_writes = fail;
        self
    }

    /// Remove all failure rules
    pub fn clear_failures(&self) {
        let mut inner = lock(&self.inner);
        inner.rules.clear();
        inner.fail_ledger_writes = false;
    }

    /// Committed statements, in execution order
    pub fn executed_statements(&self) -> Vec<String> {
        lock(&self.inner).state.statements.clone()
    }

    /// Committed ledger rows, ordered by id
    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        lock(&self.inner).state.ledger.values().cloned().collect()
    }

    pub fn ledger_entry(&self, id: &str) -> Option<LedgerEntry> {
        lock(&self.inner).state.ledger.get(id).cloned()
    }

    /// Replace a committed ledger row directly, bypassing the engine
    pub fn put_ledger_entry(&self, entry: LedgerEntry) {
        lock(&self.inner)
            .state
            .ledger
            .insert(entry.id.clone(), entry);
    }

    pub fn transactions_started(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransactionalExecutor for MemoryExecutor {
    async fn ensure_ledger(&self, table: &str) -> MigrationResult<()> {
        let mut inner = lock(&self.inner);
        if !inner.state.ledger_tables.iter().any(|t| t == table) {
            inner.state.ledger_tables.push(table.to_string());
        }
        Ok(())
    }

    async fn fetch_ledger(&self, table: &str) -> MigrationResult<Vec<LedgerEntry>> {
        let inner = lock(&self.inner);
        require_table(&inner.state, table)?;

        let mut entries: Vec<LedgerEntry> = inner.state.ledger.values().cloned().collect();
        entries.sort_by(|a, b| a.applied_at.cmp(&b.applied_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn begin(&self) -> MigrationResult<Box<dyn MigrationTransaction>> {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        let working = lock(&self.inner).state.clone();
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            working,
            savepoints: Vec::new(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

fn require_table(state: &MemoryState, table: &str) -> MigrationResult<()> {
    if state.ledger_tables.iter().any(|t| t == table) {
        Ok(())
    } else {
        Err(MigrationError::Database {
            message: format!("relation \"{}\" does not exist", table),
            code: Some("42P01".to_string()),
        })
    }
}

/// Transaction over a private copy of the in-memory state
pub struct MemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    working: MemoryState,
    savepoints: Vec<(String, MemoryState)>,
}

impl MemoryTransaction {
    fn check_ledger_write(&self, table: &str) -> MigrationResult<()> {
        if lock(&self.inner).fail_ledger_writes {
            return Err(MigrationError::database("ledger write rejected"));
        }
        require_table(&self.working, table)
    }
}

#[async_trait]
impl MigrationTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str) -> MigrationResult<u64> {
        {
            let mut inner = lock(&self.inner);
            for rule in inner.rules.iter_mut() {
                if !sql.contains(&rule.pattern) {
                    continue;
                }
                let rejected = MigrationError::Database {
                    message: rule.message.clone(),
                    code: rule.code.clone(),
                };
                match rule.remaining.as_mut() {
                    None => return Err(rejected),
                    Some(0) => {}
                    Some(remaining) => {
                        *remaining -= 1;
                        return Err(rejected);
                    }
                }
            }
        }

        self.working.statements.push(sql.to_string());
        Ok(0)
    }

    async fn upsert_ledger_entry(&mut self, table: &str, entry: &LedgerEntry) -> MigrationResult<()> {
        self.check_ledger_write(table)?;
        self.working.ledger.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn mark_rolled_back(
        &mut self,
        table: &str,
        id: &str,
        rolled_back_at: DateTime<Utc>,
    ) -> MigrationResult<()> {
        self.check_ledger_write(table)?;
        match self.working.ledger.get_mut(id) {
            Some(entry) => {
                entry.rolled_back_at = Some(rolled_back_at);
                Ok(())
            }
            None => Err(MigrationError::database(format!(
                "No ledger row for migration {}",
                id
            ))),
        }
    }

    async fn savepoint(&mut self, name: &str) -> MigrationResult<()> {
        self.savepoints.push((name.to_string(), self.working.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> MigrationResult<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| MigrationError::transaction(format!("savepoint {} does not exist", name)))?;
        // The savepoint itself survives a rollback to it
        self.savepoints.truncate(position + 1);
        self.working = self.savepoints[position].1.clone();
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> MigrationResult<()> {
        let position = self
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| MigrationError::transaction(format!("savepoint {} does not exist", name)))?;
        self.savepoints.truncate(position);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> MigrationResult<()> {
        let MemoryTransaction { inner, working, .. } = *self;
        lock(&inner).state = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrationResult<()> {
        Ok(())
    }
}
