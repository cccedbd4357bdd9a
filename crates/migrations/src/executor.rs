//! Executor - applies or reverses a single unit
//!
//! One unit is one transaction: the script's statements and the ledger write
//! commit together or not at all. Transient conflicts roll the transaction
//! back and retry it from the start.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backends::{MigrationTransaction, TransactionalExecutor};
use crate::config::MigrationConfig;
use crate::definitions::{Direction, MigrationUnit, UnitResult, UnitStatus};
use crate::error::{is_transient_failure, MigrationError, MigrationResult};
use crate::ledger::Ledger;
use crate::loader::split_sql_statements;
use crate::validation::ScriptValidator;

/// Runs single units against a transactional executor
#[derive(Clone)]
pub struct UnitExecutor {
    executor: Arc<dyn TransactionalExecutor>,
    ledger: Ledger,
    validator: ScriptValidator,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl UnitExecutor {
    pub fn new(executor: Arc<dyn TransactionalExecutor>, config: &MigrationConfig) -> Self {
        Self {
            ledger: Ledger::new(Arc::clone(&executor), config.ledger_table.clone()),
            executor,
            validator: ScriptValidator::from_config(config),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Run the unit's `up` script and record it as applied
    pub async fn apply(&self, unit: &MigrationUnit, dry_run: bool) -> UnitResult {
        self.run(unit, Direction::Up, dry_run).await
    }

    /// Run the unit's `down` script and record it as rolled back
    pub async fn rollback(&self, unit: &MigrationUnit, dry_run: bool) -> UnitResult {
        self.run(unit, Direction::Down, dry_run).await
    }

    pub async fn run(&self, unit: &MigrationUnit, direction: Direction, dry_run: bool) -> UnitResult {
        let started = Instant::now();
        let statements = split_sql_statements(unit.script(direction));

        let warnings = self.validator.check(&statements);
        for warning in &warnings {
            warn!("Migration {} ({}): {}", unit.id, direction, warning);
        }

        if dry_run {
            debug!(
                "Dry run of migration {} ({}): {} statement(s)",
                unit.id,
                direction,
                statements.len()
            );
            return UnitResult {
                unit: unit.clone(),
                direction,
                status: UnitStatus::Previewed { statements },
                execution_time_ms: elapsed_ms(started),
                warnings,
                attempts: 0,
            };
        }

        let mut attempts = 0;
        let status = loop {
            attempts += 1;
            match self.run_transaction(unit, direction, &statements, started).await {
                Ok(()) => break UnitStatus::Succeeded,
                Err(e) if attempts <= self.max_retries && is_transient_failure(&e) => {
                    warn!(
                        "Transient failure on attempt {} of migration {}, retrying: {}",
                        attempts, unit.id, e
                    );
                    let backoff = self.retry_backoff_ms.saturating_mul(u64::from(attempts));
                    if backoff > 0 {
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
                Err(e) => {
                    error!("Migration {} ({}) failed: {}", unit.id, direction, e);
                    break UnitStatus::Failed {
                        error: e.to_string(),
                    };
                }
            }
        };

        let execution_time_ms = elapsed_ms(started);
        if status == UnitStatus::Succeeded {
            info!(
                "Migration {} {} in {}ms",
                unit.id,
                match direction {
                    Direction::Up => "applied",
                    Direction::Down => "rolled back",
                },
                execution_time_ms
            );
        }

        UnitResult {
            unit: unit.clone(),
            direction,
            status,
            execution_time_ms,
            warnings,
            attempts,
        }
    }

    async fn run_transaction(
        &self,
        unit: &MigrationUnit,
        direction: Direction,
        statements: &[String],
        started: Instant,
    ) -> MigrationResult<()> {
        let mut tx = self.executor.begin().await?;

        match self
            .run_statements(tx.as_mut(), unit, direction, statements, started)
            .await
        {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(
                        "Failed to roll back transaction for migration {}: {}",
                        unit.id, rollback_error
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_statements(
        &self,
        tx: &mut dyn MigrationTransaction,
        unit: &MigrationUnit,
        direction: Direction,
        statements: &[String],
        started: Instant,
    ) -> MigrationResult<()> {
        let total = statements.len();

        for (index, statement) in statements.iter().enumerate() {
            let savepoint = format!("elif_migration_sp_{}", index + 1);
            tx.savepoint(&savepoint).await?;

            if let Err(e) = tx.execute(statement).await {
                // Leaves the transaction usable so the rollback reports cleanly
                if let Err(restore_error) = tx.rollback_to_savepoint(&savepoint).await {
                    debug!("Could not restore savepoint {}: {}", savepoint, restore_error);
                }
                return Err(MigrationError::Execution {
                    migration: unit.id.clone(),
                    message: format!("statement {} of {} failed: {}", index + 1, total, e),
                    code: e.sqlstate().map(str::to_string),
                });
            }

            tx.release_savepoint(&savepoint).await?;
        }

        match direction {
            Direction::Up => {
                self.ledger
                    .record_applied(tx, unit, elapsed_ms(started))
                    .await?;
            }
            Direction::Down => {
                self.ledger.record_rolled_back(tx, unit).await?;
            }
        }

        Ok(())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryExecutor;
    use crate::checksum::compute_checksum;

    fn unit(id: &str, up: &str, down: &str) -> MigrationUnit {
        MigrationUnit {
            id: id.to_string(),
            version: id[..3].to_string(),
            name: id.to_string(),
            description: String::new(),
            up: up.to_string(),
            down: down.to_string(),
            checksum: compute_checksum(up, down),
            dependencies: Vec::new(),
            tags: Vec::new(),
        }
    }

    async fn setup(config: MigrationConfig) -> (Arc<MemoryExecutor>, UnitExecutor) {
        let backend = Arc::new(MemoryExecutor::new());
        let executor = UnitExecutor::new(backend.clone(), &config);
        executor.ledger().initialize().await.unwrap();
        (backend, executor)
    }

    #[tokio::test]
    async fn test_apply_and_rollback() {
        let (backend, executor) = setup(MigrationConfig::default()).await;
        let users = unit("001_users", "CREATE TABLE users (id INT);", "DROP TABLE users;");

        let result = executor.apply(&users, false).await;
        assert!(result.success());
        assert_eq!(result.attempts, 1);
        assert!(result.warnings.is_empty());
        assert!(backend.ledger_entry("001_users").unwrap().is_active());

        let result = executor.rollback(&users, false).await;
        assert!(result.success());
        // DROP TABLE is flagged but still runs
        assert_eq!(result.warnings.len(), 1);
        assert!(backend.ledger_entry("001_users").unwrap().rolled_back_at.is_some());
        assert_eq!(backend.executed_statements().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let (backend, executor) = setup(MigrationConfig::default()).await;
        let users = unit("001_users", "CREATE TABLE users (id INT); TRUNCATE users;", "DROP TABLE users;");

        let result = executor.apply(&users, true).await;
        assert!(result.success());
        assert!(result.is_dry_run());
        assert_eq!(result.warnings.len(), 1);
        match &result.status {
            UnitStatus::Previewed { statements } => assert_eq!(statements.len(), 2),
            other => panic!("unexpected status: {:?}", other),
        }
        assert_eq!(backend.transactions_started(), 0);
        assert!(backend.ledger_entries().is_empty());
    }

    #[tokio::test]
    async fn test_failed_statement_leaves_nothing() {
        let (backend, executor) = setup(MigrationConfig::default()).await;
        backend.fail_on("broken");
        let bad = unit(
            "001_bad",
            "CREATE TABLE fine (id INT); CREATE TABLE broken (id INT);",
            "DROP TABLE broken;",
        );

        let result = executor.apply(&bad, false).await;
        assert!(!result.success());
        let error = result.error().unwrap();
        assert!(error.contains("statement 2 of 2 failed"));
        assert!(backend.ledger_entry("001_bad").is_none());
        assert!(backend.executed_statements().is_empty());
    }

    #[tokio::test]
    async fn test_failed_ledger_write_leaves_nothing() {
        let (backend, executor) = setup(MigrationConfig::default()).await;
        backend.fail_ledger_writes(true);
        let users = unit("001_users", "CREATE TABLE users (id INT);", "DROP TABLE users;");

        let result = executor.apply(&users, false).await;
        assert!(!result.success());
        assert!(backend.executed_statements().is_empty());
    }

    #[tokio::test]
    async fn test_scripts_run_as_written() {
        let (backend, executor) = setup(MigrationConfig::default()).await;
        let function = "CREATE FUNCTION touch() RETURNS trigger LANGUAGE plpgsql AS $$\nBEGIN\n  NEW.updated_at := now();\n  RETURN NEW;\nEND;\n$$;";
        let do_block = "DO $$ BEGIN IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'app') THEN CREATE ROLE app; END IF; END $$;";
        let up = format!("{}\n{}\n", function, do_block);
        let touch = unit("001_touch", &up, "DROP FUNCTION touch();");

        let result = executor.apply(&touch, false).await;
        assert!(result.success());
        assert_eq!(backend.executed_statements(), vec![function.to_string(), do_block.to_string()]);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let config = MigrationConfig::default().with_retry_backoff_ms(0);
        let (backend, executor) = setup(config).await;
        backend.fail_on("events_40001");
        let events = unit("001_events", "CREATE TABLE events_40001 (id INT);", "DROP TABLE events_40001;");

        let result = executor.apply(&events, false).await;
        assert!(!result.success());
        assert_eq!(result.attempts, 1);
        assert_eq!(backend.transactions_started(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let config = MigrationConfig::default().with_retry_backoff_ms(0);
        let (backend, executor) = setup(config).await;
        backend.fail_transiently("contended", 2);
        let users = unit("001_users", "CREATE TABLE contended (id INT);", "DROP TABLE contended;");

        let result = executor.apply(&users, false).await;
        assert!(result.success());
        assert_eq!(result.attempts, 3);
        assert_eq!(backend.executed_statements().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let config = MigrationConfig::default()
            .with_retry_backoff_ms(0)
            .with_max_retries(1);
        let (backend, executor) = setup(config).await;
        backend.fail_transiently("contended", 5);
        let users = unit("001_users", "CREATE TABLE contended (id INT);", "DROP TABLE contended;");

        let result = executor.apply(&users, false).await;
        assert!(!result.success());
        assert_eq!(result.attempts, 2);
        assert!(backend.ledger_entries().is_empty());
    }
}
