//! Migration Runner - Executes plans unit by unit
//!
//! Units run strictly one after another in plan order. The first failure
//! stops the run; earlier units stay committed and later ones are reported
//! as not attempted.

use tracing::{error, info};

use crate::definitions::{Plan, PlanExecution};
use crate::executor::UnitExecutor;

/// Sequential plan runner
pub struct PlanRunner<'a> {
    executor: &'a UnitExecutor,
}

impl<'a> PlanRunner<'a> {
    pub fn new(executor: &'a UnitExecutor) -> Self {
        Self { executor }
    }

    /// Execute every unit in `plan`, halting on the first failure
    pub async fn execute_plan(&self, plan: &Plan) -> PlanExecution {
        let mut execution = PlanExecution {
            plan_id: plan.id,
            direction: plan.direction,
            results: Vec::with_capacity(plan.len()),
            not_attempted: Vec::new(),
        };

        if plan.is_empty() {
            info!("Nothing to run ({})", plan.direction);
            return execution;
        }

        info!(
            "Running plan {} ({}): {} unit(s){}",
            plan.id,
            plan.direction,
            plan.len(),
            if plan.dry_run { ", dry run" } else { "" }
        );

        for (index, unit) in plan.units.iter().enumerate() {
            info!("[{}/{}] {} {}", index + 1, plan.len(), plan.direction, unit.id);
            let result = self.executor.run(unit, plan.direction, plan.dry_run).await;
            let failed = !result.success();
            execution.results.push(result);

            if failed {
                execution.not_attempted = plan.units[index + 1..]
                    .iter()
                    .map(|u| u.id.clone())
                    .collect();
                error!(
                    "Plan {} halted at {}; {} unit(s) not attempted",
                    plan.id,
                    unit.id,
                    execution.not_attempted.len()
                );
                break;
            }
        }

        execution
    }
}
