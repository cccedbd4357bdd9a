//! Migrator - the operational surface of the engine
//!
//! Every call reloads the migration files and re-reads the ledger, so the
//! results always reflect the current disk and database state.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backends::TransactionalExecutor;
use crate::config::MigrationConfig;
use crate::definitions::{
    Direction, IntegrityReport, LedgerEntry, LoadReport, MigrationUnit, NewMigration, Plan,
    PlanExecution, StatusReport, NO_VERSION,
};
use crate::error::MigrationResult;
use crate::executor::UnitExecutor;
use crate::integrity::validate_integrity;
use crate::ledger::Ledger;
use crate::loader::MigrationLoader;
use crate::planner::Planner;
use crate::rollback::MigrationRollback;
use crate::runner::PlanRunner;

/// Migration engine bound to one migrations directory and one database
pub struct Migrator {
    config: MigrationConfig,
    loader: MigrationLoader,
    executor: UnitExecutor,
}

impl Migrator {
    pub fn new(config: MigrationConfig, executor: Arc<dyn TransactionalExecutor>) -> Self {
        Self {
            loader: MigrationLoader::from_config(&config),
            executor: UnitExecutor::new(executor, &config),
            config,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn loader(&self) -> &MigrationLoader {
        &self.loader
    }

    pub fn ledger(&self) -> &Ledger {
        self.executor.ledger()
    }

    /// Create the ledger table if it does not exist yet
    pub async fn initialize(&self) -> MigrationResult<()> {
        self.ledger().initialize().await
    }

    /// Load units from disk, reporting skipped ones
    pub fn load(&self) -> MigrationResult<LoadReport> {
        self.loader.load_all()
    }

    pub(crate) async fn snapshot(&self) -> MigrationResult<(LoadReport, Vec<LedgerEntry>)> {
        let report = self.load()?;
        let ledger = self.ledger().get_applied().await?;
        debug!(
            "Snapshot: {} unit(s) on disk, {} ledger row(s)",
            report.units.len(),
            ledger.len()
        );
        Ok((report, ledger))
    }

    /// Counts of loaded, applied, pending and rolled back units
    pub async fn status(&self) -> MigrationResult<StatusReport> {
        let (report, ledger) = self.snapshot().await?;

        let active: Vec<&LedgerEntry> = ledger.iter().filter(|e| e.is_active()).collect();
        let pending = report
            .units
            .iter()
            .filter(|u| !active.iter().any(|e| e.id == u.id))
            .count();
        let last_applied = active
            .iter()
            .max_by(|a, b| {
                a.applied_at
                    .cmp(&b.applied_at)
                    .then_with(|| a.version.cmp(&b.version))
            })
            .map(|e| (*e).clone());
        let database_version = active
            .iter()
            .map(|e| e.version.as_str())
            .max()
            .unwrap_or(NO_VERSION)
            .to_string();

        Ok(StatusReport {
            total: report.units.len(),
            applied: active.len(),
            pending,
            rolled_back: ledger.len() - active.len(),
            failed: report.warnings.len(),
            last_applied,
            database_version,
        })
    }

    /// Compute a plan without running it
    pub async fn plan(
        &self,
        target_version: Option<&str>,
        direction: Direction,
        dry_run: bool,
    ) -> MigrationResult<Plan> {
        let (report, ledger) = self.snapshot().await?;
        Planner::plan(&report.units, &ledger, target_version, direction, dry_run)
    }

    /// Compute the plan that reverses the `n` most recently applied units
    pub async fn plan_rollback_last(&self, n: usize, dry_run: bool) -> MigrationResult<Plan> {
        let (report, ledger) = self.snapshot().await?;
        Planner::plan_rollback_last(&report.units, &ledger, n, dry_run)
    }

    /// Run a previously computed plan
    pub async fn execute_plan(&self, plan: &Plan) -> PlanExecution {
        PlanRunner::new(&self.executor).execute_plan(plan).await
    }

    /// Apply pending units up to and including `target_version`
    pub async fn migrate(
        &self,
        target_version: Option<&str>,
        dry_run: bool,
    ) -> MigrationResult<PlanExecution> {
        let plan = self.plan(target_version, Direction::Up, dry_run).await?;
        let execution = self.execute_plan(&plan).await;
        if execution.success() && !plan.is_empty() && !dry_run {
            info!("Applied {} migration(s)", execution.results.len());
        }
        Ok(execution)
    }

    /// Roll back every active unit above `target_version`; `None` rolls back
    /// everything
    pub async fn rollback(
        &self,
        target_version: Option<&str>,
        dry_run: bool,
    ) -> MigrationResult<PlanExecution> {
        self.rollback_to_version(target_version, dry_run).await
    }

    /// Cross-check the ledger against the files on disk
    pub async fn validate(&self) -> MigrationResult<IntegrityReport> {
        let (report, ledger) = self.snapshot().await?;
        Ok(validate_integrity(&report.units, &ledger))
    }

    /// Ledger rows, most recent first
    pub async fn history(&self, limit: usize) -> MigrationResult<Vec<LedgerEntry>> {
        self.ledger().history(limit).await
    }

    /// Author a new unit on disk
    pub fn create(&self, new: NewMigration) -> MigrationResult<MigrationUnit> {
        self.loader.create_unit(new)
    }
}
