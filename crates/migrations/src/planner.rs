//! Planner - computes ordered, validated execution lists
//!
//! Forward plans run ascending by version, backward plans strictly
//! descending. A plan is either fully valid or rejected; nothing partially
//! valid is ever returned.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use uuid::Uuid;

use crate::definitions::{Direction, LedgerEntry, MigrationUnit, Plan};
use crate::error::{MigrationError, MigrationResult};

/// Fixed per-unit cost in the duration estimate
const ESTIMATE_FLOOR_MS: u64 = 50;
/// Script bytes counted as one millisecond in the duration estimate
const ESTIMATE_BYTES_PER_MS: u64 = 100;

/// Stateless planner over loaded units and a ledger snapshot
pub struct Planner;

impl Planner {
    /// Plan a forward or backward run.
    ///
    /// Forward with a target includes units with `version <= target`;
    /// backward with a target reverses units with `version > target`.
    pub fn plan(
        units: &[MigrationUnit],
        ledger: &[LedgerEntry],
        target_version: Option<&str>,
        direction: Direction,
        dry_run: bool,
    ) -> MigrationResult<Plan> {
        let ordered = match direction {
            Direction::Up => Self::forward(units, ledger, target_version)?,
            Direction::Down => {
                let mut selected: Vec<&LedgerEntry> = ledger
                    .iter()
                    .filter(|e| e.is_active())
                    .filter(|e| target_version.map_or(true, |t| e.version.as_str() > t))
                    .collect();
                selected.sort_by(|a, b| b.version.cmp(&a.version).then_with(|| b.id.cmp(&a.id)));
                Self::backward(units, ledger, &selected)?
            }
        };

        Ok(Self::build(ordered, direction, dry_run))
    }

    /// Plan the rollback of the `n` most recently applied active units,
    /// executed in descending version order
    pub fn plan_rollback_last(
        units: &[MigrationUnit],
        ledger: &[LedgerEntry],
        n: usize,
        dry_run: bool,
    ) -> MigrationResult<Plan> {
        let mut recent: Vec<&LedgerEntry> = ledger.iter().filter(|e| e.is_active()).collect();
        recent.sort_by(|a, b| {
            b.applied_at
                .cmp(&a.applied_at)
                .then_with(|| b.version.cmp(&a.version))
        });
        recent.truncate(n);
        recent.sort_by(|a, b| b.version.cmp(&a.version).then_with(|| b.id.cmp(&a.id)));

        let ordered = Self::backward(units, ledger, &recent)?;
        Ok(Self::build(ordered, Direction::Down, dry_run))
    }

    fn forward(
        units: &[MigrationUnit],
        ledger: &[LedgerEntry],
        target_version: Option<&str>,
    ) -> MigrationResult<Vec<MigrationUnit>> {
        let active: HashSet<&str> = ledger
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.id.as_str())
            .collect();

        let mut candidates: Vec<&MigrationUnit> = units
            .iter()
            .filter(|u| !active.contains(u.id.as_str()))
            .filter(|u| target_version.map_or(true, |t| u.version.as_str() <= t))
            .collect();
        candidates.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));

        // Single pass: a dependency is satisfied by the ledger or by an
        // earlier position in this plan
        let mut scheduled: HashSet<&str> = HashSet::new();
        for unit in &candidates {
            for dependency in &unit.dependencies {
                if !active.contains(dependency.as_str()) && !scheduled.contains(dependency.as_str()) {
                    return Err(MigrationError::DependencyUnsatisfied {
                        migration: unit.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            scheduled.insert(unit.id.as_str());
        }

        Ok(candidates.into_iter().cloned().collect())
    }

    /// Resolve ordered ledger entries to reversible units and make sure no
    /// unit is reversed while something that depends on it stays active
    fn backward(
        units: &[MigrationUnit],
        ledger: &[LedgerEntry],
        ordered: &[&LedgerEntry],
    ) -> MigrationResult<Vec<MigrationUnit>> {
        let by_id: HashMap<&str, &MigrationUnit> =
            units.iter().map(|u| (u.id.as_str(), u)).collect();

        let mut resolved = Vec::with_capacity(ordered.len());
        for entry in ordered {
            let unit = by_id.get(entry.id.as_str()).ok_or_else(|| {
                MigrationError::MissingMigration {
                    migration: entry.id.clone(),
                }
            })?;
            if !unit.is_reversible() {
                return Err(MigrationError::NotReversible {
                    migration: unit.id.clone(),
                });
            }
            resolved.push((*unit).clone());
        }

        let active: Vec<&LedgerEntry> = ledger.iter().filter(|e| e.is_active()).collect();
        for (position, unit) in resolved.iter().enumerate() {
            let reversed_before: HashSet<&str> =
                resolved[..position].iter().map(|u| u.id.as_str()).collect();

            let blocking = active.iter().find(|entry| {
                entry.id != unit.id
                    && !reversed_before.contains(entry.id.as_str())
                    && depends_on(entry, by_id.get(entry.id.as_str()).copied(), &unit.id)
            });

            if let Some(dependent) = blocking {
                return Err(MigrationError::RollbackBlocked {
                    migration: unit.id.clone(),
                    dependent: dependent.id.clone(),
                });
            }
        }

        Ok(resolved)
    }

    fn build(units: Vec<MigrationUnit>, direction: Direction, dry_run: bool) -> Plan {
        let estimated_duration_ms = units
            .iter()
            .map(|u| estimate_ms(u.script(direction)))
            .sum();

        Plan {
            id: Uuid::new_v4(),
            units,
            direction,
            dry_run,
            created_at: Utc::now(),
            estimated_duration_ms,
        }
    }
}

/// Dependencies recorded at apply time, plus the ones the file declares now
fn depends_on(entry: &LedgerEntry, unit: Option<&MigrationUnit>, id: &str) -> bool {
    entry.dependencies.iter().any(|d| d == id)
        || unit.map_or(false, |u| u.dependencies.iter().any(|d| d == id))
}

fn estimate_ms(script: &str) -> u64 {
    ESTIMATE_FLOOR_MS + script.len() as u64 / ESTIMATE_BYTES_PER_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn unit(id: &str, deps: &[&str]) -> MigrationUnit {
        MigrationUnit {
            id: id.to_string(),
            version: id[..3].to_string(),
            name: id.to_string(),
            description: String::new(),
            up: format!("CREATE TABLE t{} (id INT);", &id[..3]),
            down: format!("DROP TABLE t{};", &id[..3]),
            checksum: "c".to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            tags: Vec::new(),
        }
    }

    fn applied(unit: &MigrationUnit, minutes_ago: i64) -> LedgerEntry {
        LedgerEntry::applied(unit, Utc::now() - Duration::minutes(minutes_ago), 1)
    }

    fn ids(plan: &Plan) -> Vec<&str> {
        plan.unit_ids()
    }

    #[test]
    fn test_forward_plan_orders_by_version() {
        let units = vec![unit("001_a", &[]), unit("002_b", &["001_a"]), unit("003_c", &["002_b"])];
        let plan = Planner::plan(&units, &[], None, Direction::Up, false).unwrap();
        assert_eq!(ids(&plan), vec!["001_a", "002_b", "003_c"]);
        assert_eq!(plan.direction, Direction::Up);
        assert!(plan.estimated_duration_ms >= 3 * ESTIMATE_FLOOR_MS);
    }

    #[test]
    fn test_forward_plan_respects_target_and_ledger() {
        let units = vec![unit("001_a", &[]), unit("002_b", &["001_a"]), unit("003_c", &[])];
        let ledger = vec![applied(&units[0], 5)];

        let plan = Planner::plan(&units, &ledger, Some("002"), Direction::Up, true).unwrap();
        assert_eq!(ids(&plan), vec!["002_b"]);
        assert!(plan.dry_run);
    }

    #[test]
    fn test_rolled_back_units_are_candidates_again() {
        let units = vec![unit("001_a", &[])];
        let mut entry = applied(&units[0], 5);
        entry.rolled_back_at = Some(Utc::now());

        let plan = Planner::plan(&units, &[entry], None, Direction::Up, false).unwrap();
        assert_eq!(ids(&plan), vec!["001_a"]);
    }

    #[test]
    fn test_unsatisfied_dependency_rejects_plan() {
        let units = vec![unit("001_a", &[]), unit("002_b", &["001_a"])];

        // The dependency is neither loaded nor in the ledger
        let err = Planner::plan(&units[1..], &[], None, Direction::Up, false).unwrap_err();
        match err {
            MigrationError::DependencyUnsatisfied { migration, dependency } => {
                assert_eq!(migration, "002_b");
                assert_eq!(dependency, "001_a");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_dependency_on_later_version_is_unsatisfied() {
        let units = vec![unit("001_a", &["002_b"]), unit("002_b", &[])];
        let err = Planner::plan(&units, &[], None, Direction::Up, false).unwrap_err();
        assert!(matches!(err, MigrationError::DependencyUnsatisfied { .. }));
    }

    #[test]
    fn test_backward_plan_descending() {
        let units = vec![unit("001_a", &[]), unit("002_b", &["001_a"]), unit("003_c", &["002_b"])];
        let ledger: Vec<_> = units.iter().map(|u| applied(u, 1)).collect();

        let plan = Planner::plan(&units, &ledger, None, Direction::Down, false).unwrap();
        assert_eq!(ids(&plan), vec!["003_c", "002_b", "001_a"]);

        let plan = Planner::plan(&units, &ledger, Some("001"), Direction::Down, false).unwrap();
        assert_eq!(ids(&plan), vec!["003_c", "002_b"]);
    }

    #[test]
    fn test_backward_plan_blocked_by_active_dependent() {
        // 001 depends on 002 (applied out of version order); reversing 002
        // while 001 stays active is refused
        let units = vec![unit("001_a", &["002_b"]), unit("002_b", &[])];
        let ledger = vec![applied(&units[1], 10), applied(&units[0], 5)];

        let err = Planner::plan(&units, &ledger, Some("001"), Direction::Down, false).unwrap_err();
        match err {
            MigrationError::RollbackBlocked { migration, dependent } => {
                assert_eq!(migration, "002_b");
                assert_eq!(dependent, "001_a");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_backward_plan_requires_files_and_down_script() {
        let mut units = vec![unit("001_a", &[]), unit("002_b", &[])];
        let ledger: Vec<_> = units.iter().map(|u| applied(u, 1)).collect();

        let err = Planner::plan(&units[..1], &ledger, None, Direction::Down, false).unwrap_err();
        assert!(matches!(err, MigrationError::MissingMigration { .. }));

        units[1].down = "  ".to_string();
        let err = Planner::plan(&units, &ledger, None, Direction::Down, false).unwrap_err();
        assert!(matches!(err, MigrationError::NotReversible { .. }));
    }

    #[test]
    fn test_rollback_last_uses_apply_time_then_version_order() {
        let units = vec![unit("001_a", &[]), unit("002_b", &["001_a"]), unit("003_c", &["002_b"])];
        let ledger = vec![
            applied(&units[0], 30),
            applied(&units[1], 20),
            applied(&units[2], 10),
        ];

        let plan = Planner::plan_rollback_last(&units, &ledger, 2, false).unwrap();
        assert_eq!(ids(&plan), vec!["003_c", "002_b"]);

        let plan = Planner::plan_rollback_last(&units, &ledger, 0, false).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_replanning_is_deterministic() {
        let units = vec![unit("001_a", &[]), unit("002_b", &["001_a"]), unit("003_c", &[])];
        let first = Planner::plan(&units, &[], None, Direction::Up, false).unwrap();
        let second = Planner::plan(&units, &[], None, Direction::Up, false).unwrap();
        assert_eq!(first.units, second.units);
        assert_eq!(first.estimated_duration_ms, second.estimated_duration_ms);
    }
}
