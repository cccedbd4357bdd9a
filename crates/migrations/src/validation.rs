//! Static script validation
//!
//! Flags statements that match the configured deny/caution lists. Findings
//! are warnings only; they never stop a migration from running.

use regex::{Regex, RegexBuilder};

use crate::config::MigrationConfig;

/// Compile a configured pattern, case-insensitive and multi-line
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Destructive,
    Caution,
}

/// Statement validator built from configuration
#[derive(Debug, Clone)]
pub struct ScriptValidator {
    rules: Vec<(Severity, Regex)>,
}

impl ScriptValidator {
    /// Build from configuration. Patterns that fail to compile are skipped;
    /// [`MigrationConfig::validate`] reports them up front.
    pub fn from_config(config: &MigrationConfig) -> Self {
        let deny = config
            .deny_patterns
            .iter()
            .map(|p| (Severity::Destructive, p));
        let caution = config
            .caution_patterns
            .iter()
            .map(|p| (Severity::Caution, p));

        let rules = deny
            .chain(caution)
            .filter_map(|(severity, pattern)| match compile_pattern(pattern) {
                Ok(regex) => Some((severity, regex)),
                Err(e) => {
                    tracing::warn!("Ignoring invalid validation pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Self { rules }
    }

    /// Check each statement and return one warning per flagged statement
    pub fn check(&self, statements: &[String]) -> Vec<String> {
        let mut warnings = Vec::new();

        for (index, statement) in statements.iter().enumerate() {
            let strongest = self
                .rules
                .iter()
                .filter(|(_, regex)| regex.is_match(statement))
                .map(|(severity, _)| *severity)
                .min_by_key(|severity| match severity {
                    Severity::Destructive => 0,
                    Severity::Caution => 1,
                });

            if let Some(severity) = strongest {
                let label = match severity {
                    Severity::Destructive => "potentially destructive statement detected",
                    Severity::Caution => "statement requires review",
                };
                warnings.push(format!(
                    "{} (statement {}): {}",
                    label,
                    index + 1,
                    preview(statement)
                ));
            }
        }

        warnings
    }
}

fn preview(statement: &str) -> String {
    let flat = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 80 {
        format!("{}...", flat.chars().take(77).collect::<String>())
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements(sql: &[&str]) -> Vec<String> {
        sql.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_destructive_statements_flagged() {
        let validator = ScriptValidator::from_config(&MigrationConfig::default());
        let warnings = validator.check(&statements(&[
            "CREATE TABLE users (id INT);",
            "drop table legacy_users;",
            "TRUNCATE audit_log;",
            "DELETE FROM sessions;",
            "DELETE FROM sessions WHERE expired = true;",
        ]));

        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].starts_with("potentially destructive statement detected (statement 2)"));
        assert!(warnings[1].contains("statement 3"));
        assert!(warnings[2].contains("DELETE FROM sessions;"));
    }

    #[test]
    fn test_caution_statements_flagged() {
        let validator = ScriptValidator::from_config(&MigrationConfig::default());
        let warnings = validator.check(&statements(&["ALTER TABLE users DROP COLUMN nickname;"]));

        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("statement requires review"));
    }

    #[test]
    fn test_custom_patterns() {
        let config = MigrationConfig::default().deny(r"\bVACUUM\s+FULL\b");
        let validator = ScriptValidator::from_config(&config);
        let warnings = validator.check(&statements(&["vacuum full orders;"]));
        assert_eq!(warnings.len(), 1);
    }
}
