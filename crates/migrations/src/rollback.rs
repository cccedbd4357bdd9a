//! Migration Rollback - Reverses applied units
//!
//! Rollbacks run the units' `down` scripts in strictly descending version
//! order. Each reversed unit keeps its ledger row with `rolled_back_at` set.

use tracing::info;

use crate::definitions::{Direction, PlanExecution};
use crate::error::MigrationResult;
use crate::migrator::Migrator;

/// Rollback operations on top of the migrator
#[allow(async_fn_in_trait)]
pub trait MigrationRollback {
    /// Roll back every active unit with a version above `target_version`.
    /// `None` rolls back every active unit.
    async fn rollback_to_version(
        &self,
        target_version: Option<&str>,
        dry_run: bool,
    ) -> MigrationResult<PlanExecution>;

    /// Roll back the `n` most recently applied active units
    async fn rollback_last(&self, n: usize, dry_run: bool) -> MigrationResult<PlanExecution>;
}

impl MigrationRollback for Migrator {
    async fn rollback_to_version(
        &self,
        target_version: Option<&str>,
        dry_run: bool,
    ) -> MigrationResult<PlanExecution> {
        let plan = self.plan(target_version, Direction::Down, dry_run).await?;
        let execution = self.execute_plan(&plan).await;

        if execution.success() && !plan.is_empty() && !dry_run {
            info!(
                "Rolled back {} migration(s) to version {}",
                plan.len(),
                target_version.unwrap_or(crate::definitions::NO_VERSION)
            );
        }
        Ok(execution)
    }

    async fn rollback_last(&self, n: usize, dry_run: bool) -> MigrationResult<PlanExecution> {
        if n == 0 {
            return Ok(PlanExecution::empty(Direction::Down));
        }

        let plan = self.plan_rollback_last(n, dry_run).await?;
        let execution = self.execute_plan(&plan).await;

        if execution.success() && !plan.is_empty() && !dry_run {
            info!("Rolled back the last {} migration(s)", plan.len());
        }
        Ok(execution)
    }
}
