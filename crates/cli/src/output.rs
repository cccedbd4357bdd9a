//! Human and JSON rendering of engine results

use console::style;
use serde::Serialize;

use elif_migrations::{
    IntegrityReport, LedgerEntry, MigrationUnit, Plan, PlanExecution, StatusReport, UnitResult,
    UnitStatus,
};

/// Print any result as pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_created(unit: &MigrationUnit, path: &std::path::Path) {
    println!(
        "{} {}",
        style("Created migration").green().bold(),
        style(&unit.id).cyan()
    );
    println!("  {}", path.display());
}

pub fn print_status(status: &StatusReport) {
    println!("{}", style("Migration Status").bold());
    println!("  total:            {}", status.total);
    println!("  applied:          {}", style(status.applied).green());
    println!("  pending:          {}", style(status.pending).yellow());
    println!("  rolled back:      {}", status.rolled_back);
    if status.failed > 0 {
        println!("  failed to load:   {}", style(status.failed).red());
    }
    println!("  database version: {}", status.database_version);
    if let Some(last) = &status.last_applied {
        println!(
            "  last applied:     {} at {}",
            last.id,
            last.applied_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}

pub fn print_plan(plan: &Plan) {
    if plan.is_empty() {
        println!("Nothing to {}", direction_verb(plan));
        return;
    }

    println!(
        "{} {} unit(s), about {}ms",
        style(format!("Plan ({})", plan.direction)).bold(),
        plan.len(),
        plan.estimated_duration_ms
    );
    for (index, unit) in plan.units.iter().enumerate() {
        println!("  {:>3}. {}", index + 1, unit.id);
    }
}

pub fn print_execution(execution: &PlanExecution) {
    if execution.results.is_empty() {
        println!("Nothing to do");
        return;
    }

    for result in &execution.results {
        print_result(result);
    }

    for id in &execution.not_attempted {
        println!("  {} {} (not attempted)", style("-").dim(), style(id).dim());
    }

    let failed = execution.failure().is_some();
    let summary = format!(
        "{} of {} unit(s) succeeded",
        execution.results.iter().filter(|r| r.success()).count(),
        execution.results.len() + execution.not_attempted.len()
    );
    if failed {
        println!("{}", style(summary).red().bold());
    } else {
        println!("{}", style(summary).green().bold());
    }
}

fn print_result(result: &UnitResult) {
    match &result.status {
        UnitStatus::Succeeded => println!(
            "  {} {} ({}ms{})",
            style("✓").green(),
            result.unit.id,
            result.execution_time_ms,
            retries_note(result)
        ),
        UnitStatus::Previewed { statements } => {
            println!(
                "  {} {} (dry run, {} statement(s))",
                style("○").cyan(),
                result.unit.id,
                statements.len()
            );
            for statement in statements {
                println!("      {}", style(statement).dim());
            }
        }
        UnitStatus::Failed { error } => println!(
            "  {} {}: {}",
            style("✗").red(),
            result.unit.id,
            style(error).red()
        ),
    }

    for warning in &result.warnings {
        println!("      {} {}", style("!").yellow(), warning);
    }
}

fn retries_note(result: &UnitResult) -> String {
    if result.attempts > 1 {
        format!(", {} attempts", result.attempts)
    } else {
        String::new()
    }
}

fn direction_verb(plan: &Plan) -> &'static str {
    match plan.direction {
        elif_migrations::Direction::Up => "apply",
        elif_migrations::Direction::Down => "roll back",
    }
}

pub fn print_integrity(report: &IntegrityReport) {
    if report.valid {
        println!("{}", style("Ledger and migration files agree").green());
        return;
    }

    println!(
        "{}",
        style(format!("{} integrity issue(s)", report.issues.len())).red().bold()
    );
    for issue in &report.issues {
        println!(
            "  {} [{:?}] {}",
            style("✗").red(),
            issue.kind,
            issue.message
        );
    }
}

pub fn print_history(entries: &[LedgerEntry]) {
    if entries.is_empty() {
        println!("No migrations have been applied");
        return;
    }

    for entry in entries {
        let state = match entry.rolled_back_at {
            Some(at) => style(format!(
                "rolled back {}",
                at.format("%Y-%m-%d %H:%M:%S")
            ))
            .yellow(),
            None => style("applied".to_string()).green(),
        };
        println!(
            "  {}  {}  {}ms  {}",
            entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
            entry.id,
            entry.execution_time_ms,
            state
        );
    }
}
