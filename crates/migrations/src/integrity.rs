//! Integrity checks between the ledger and the migration files
//!
//! Reporting only. Nothing here repairs the ledger or the schema.

use std::collections::HashMap;

use crate::definitions::{
    IntegrityIssue, IntegrityIssueKind, IntegrityReport, LedgerEntry, MigrationUnit,
};

/// Cross-check every ledger row against the loaded units
pub fn validate_integrity(units: &[MigrationUnit], ledger: &[LedgerEntry]) -> IntegrityReport {
    let by_id: HashMap<&str, &MigrationUnit> = units.iter().map(|u| (u.id.as_str(), u)).collect();
    let entries: HashMap<&str, &LedgerEntry> = ledger.iter().map(|e| (e.id.as_str(), e)).collect();
    let mut issues = Vec::new();

    for entry in ledger {
        match by_id.get(entry.id.as_str()) {
            None => issues.push(IntegrityIssue {
                migration_id: entry.id.clone(),
                kind: IntegrityIssueKind::MissingFile,
                message: format!("Migration {} is in the ledger but has no files", entry.id),
            }),
            Some(unit) if unit.checksum != entry.checksum => issues.push(IntegrityIssue {
                migration_id: entry.id.clone(),
                kind: IntegrityIssueKind::ChecksumMismatch,
                message: format!(
                    "Migration {} changed after it was applied (ledger {}, files {})",
                    entry.id,
                    short(&entry.checksum),
                    short(&unit.checksum)
                ),
            }),
            Some(_) => {}
        }

        if !entry.is_active() {
            continue;
        }

        for dependency in &entry.dependencies {
            let satisfied = entries
                .get(dependency.as_str())
                .map_or(false, |dep| dep.is_active());
            if !satisfied {
                issues.push(IntegrityIssue {
                    migration_id: entry.id.clone(),
                    kind: IntegrityIssueKind::DependencyMissing,
                    message: format!(
                        "Migration {} is applied but its dependency {} is not",
                        entry.id, dependency
                    ),
                });
            }
        }
    }

    for issue in &issues {
        tracing::warn!("Integrity issue: {}", issue.message);
    }

    IntegrityReport {
        valid: issues.is_empty(),
        issues,
    }
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::checksum::compute_checksum;

    fn unit(id: &str, up: &str) -> MigrationUnit {
        MigrationUnit {
            id: id.to_string(),
            version: id[..3].to_string(),
            name: id.to_string(),
            description: String::new(),
            up: up.to_string(),
            down: "SELECT 1;".to_string(),
            checksum: compute_checksum(up, "SELECT 1;"),
            dependencies: Vec::new(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_clean_ledger_is_valid() {
        let a = unit("001_a", "CREATE TABLE a (id INT);");
        let ledger = vec![LedgerEntry::applied(&a, Utc::now(), 1)];

        let report = validate_integrity(&[a], &ledger);
        assert!(report.valid);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_missing_file_and_drift() {
        let a = unit("001_a", "CREATE TABLE a (id INT);");
        let b = unit("002_b", "CREATE TABLE b (id INT);");
        let ledger = vec![
            LedgerEntry::applied(&a, Utc::now(), 1),
            LedgerEntry::applied(&b, Utc::now(), 1),
        ];
        let edited = unit("001_a", "CREATE TABLE a (id BIGINT);");

        let report = validate_integrity(&[edited], &ledger);
        assert!(!report.valid);
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.issues[0].kind, IntegrityIssueKind::ChecksumMismatch);
        assert_eq!(report.issues[0].migration_id, "001_a");
        assert_eq!(report.issues[1].kind, IntegrityIssueKind::MissingFile);
        assert_eq!(report.issues[1].migration_id, "002_b");
    }

    #[test]
    fn test_dependency_checked_for_active_entries_only() {
        let a = unit("001_a", "CREATE TABLE a (id INT);");
        let mut b = unit("002_b", "CREATE TABLE b (id INT);");
        b.dependencies = vec!["001_a".to_string()];

        let mut a_entry = LedgerEntry::applied(&a, Utc::now(), 1);
        a_entry.rolled_back_at = Some(Utc::now());
        let b_entry = LedgerEntry::applied(&b, Utc::now(), 1);

        let report = validate_integrity(&[a.clone(), b.clone()], &[a_entry.clone(), b_entry.clone()]);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind, IntegrityIssueKind::DependencyMissing);
        assert_eq!(report.issues[0].migration_id, "002_b");

        let mut b_rolled_back = b_entry;
        b_rolled_back.rolled_back_at = Some(Utc::now());
        let report = validate_integrity(&[a, b], &[a_entry, b_rolled_back]);
        assert!(report.valid);
    }
}
