//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the fundamental types used throughout the migration system:
//! units, ledger entries, plans, per-unit results and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Database version reported when no unit is active
pub const NO_VERSION: &str = "0";

/// Metadata stored in `migration.json` next to the scripts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A versioned, bidirectional schema change. Never mutated after loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationUnit {
    /// `{version}_{name}`, also the directory name on disk
    pub id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    /// Forward script
    pub up: String,
    /// Backward script
    pub down: String,
    /// Hex SHA-256 over `up || down`
    pub checksum: String,
    /// Ids that must be active before this unit applies
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
}

impl MigrationUnit {
    /// Whether the unit can be planned for rollback. A `down` script made of
    /// comments only counts as missing.
    pub fn is_reversible(&self) -> bool {
        self.down
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && !line.starts_with("--"))
    }

    /// Script for the given direction
    pub fn script(&self, direction: Direction) -> &str {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    pub fn metadata(&self) -> UnitMetadata {
        UnitMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            dependencies: self.dependencies.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Input for authoring a new unit
#[derive(Debug, Clone, Default)]
pub struct NewMigration {
    pub name: String,
    pub description: String,
    pub up: String,
    pub down: String,
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
}

impl NewMigration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn up(mut self, sql: impl Into<String>) -> Self {
        self.up = sql.into();
        self
    }

    pub fn down(mut self, sql: impl Into<String>) -> Self {
        self.down = sql.into();
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// One ledger row, written in the same transaction as the schema change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    /// Checksum recorded at apply time, never recomputed
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub execution_time_ms: i64,
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
}

impl LedgerEntry {
    /// Build the row recorded when `unit` is applied
    pub fn applied(unit: &MigrationUnit, applied_at: DateTime<Utc>, execution_time_ms: i64) -> Self {
        Self {
            id: unit.id.clone(),
            name: unit.name.clone(),
            version: unit.version.clone(),
            description: unit.description.clone(),
            checksum: unit.checksum.clone(),
            applied_at,
            rolled_back_at: None,
            execution_time_ms,
            dependencies: unit.dependencies.clone(),
            tags: unit.tags.clone(),
        }
    }

    /// Applied and not rolled back
    pub fn is_active(&self) -> bool {
        self.rolled_back_at.is_none()
    }

    pub fn state(&self) -> UnitState {
        if self.is_active() {
            UnitState::Applied
        } else {
            UnitState::RolledBack
        }
    }
}

/// State of a unit as observed through the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// No ledger row
    Untracked,
    Applied,
    RolledBack,
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Apply the migration (run `up`)
    Up,
    /// Roll the migration back (run `down`)
    Down,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// An ordered, pre-validated list of units to apply or roll back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub units: Vec<MigrationUnit>,
    pub direction: Direction,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    /// Operator feedback only
    pub estimated_duration_ms: u64,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn unit_ids(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.id.as_str()).collect()
    }
}

/// Outcome of one unit execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    /// Script ran and the ledger was updated in one committed transaction
    Succeeded,
    /// Dry run: nothing executed
    Previewed { statements: Vec<String> },
    /// Transaction rolled back; nothing from this unit was committed
    Failed { error: String },
}

/// Per-unit result returned by the executor and plan runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit: MigrationUnit,
    pub direction: Direction,
    #[serde(flatten)]
    pub status: UnitStatus,
    pub execution_time_ms: u64,
    pub warnings: Vec<String>,
    /// Transaction attempts, more than one after transient conflicts
    pub attempts: u32,
}

impl UnitResult {
    pub fn success(&self) -> bool {
        !matches!(self.status, UnitStatus::Failed { .. })
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self.status, UnitStatus::Previewed { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            UnitStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Results of running a plan, in plan order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecution {
    pub plan_id: Uuid,
    pub direction: Direction,
    pub results: Vec<UnitResult>,
    /// Units left untouched after the first failure
    pub not_attempted: Vec<String>,
}

impl PlanExecution {
    pub fn empty(direction: Direction) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            direction,
            results: Vec::new(),
            not_attempted: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.results.iter().all(UnitResult::success)
    }

    pub fn failure(&self) -> Option<&UnitResult> {
        self.results.iter().find(|r| !r.success())
    }
}

/// Counts reported by `status()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Loaded units
    pub total: usize,
    pub applied: usize,
    /// Loaded units that are not active
    pub pending: usize,
    pub rolled_back: usize,
    /// Units whose files could not be loaded
    pub failed: usize,
    pub last_applied: Option<LedgerEntry>,
    /// Version of the highest active unit, or [`NO_VERSION`]
    pub database_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityIssueKind {
    MissingFile,
    ChecksumMismatch,
    DependencyMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub migration_id: String,
    pub kind: IntegrityIssueKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub issues: Vec<IntegrityIssue>,
}

/// A unit skipped during loading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadWarning {
    pub migration: String,
    pub reason: String,
}

impl std::fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.migration, self.reason)
    }
}

/// Units that loaded, ascending by version, plus the ones that did not
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub units: Vec<MigrationUnit>,
    pub warnings: Vec<LoadWarning>,
}

impl LoadReport {
    pub fn find(&self, id: &str) -> Option<&MigrationUnit> {
        self.units.iter().find(|u| u.id == id)
    }
}
