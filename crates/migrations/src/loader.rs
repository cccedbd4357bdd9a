//! Migration Loader - File system operations for migrations
//!
//! Each unit lives in its own directory named after the unit id:
//!
//! ```text
//! migrations/
//!   20240101120000_create_users/
//!     migration.json   -- id, name, version, description, dependencies, tags
//!     migration.sql    -- up script
//!     rollback.sql     -- down script
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Location, Token, Tokenizer};

use crate::checksum::compute_checksum;
use crate::config::MigrationConfig;
use crate::definitions::{LoadReport, LoadWarning, MigrationUnit, NewMigration, UnitMetadata};
use crate::error::{MigrationError, MigrationResult};
use crate::graph::DependencyGraph;

pub const METADATA_FILE: &str = "migration.json";
pub const UP_FILE: &str = "migration.sql";
pub const DOWN_FILE: &str = "rollback.sql";

const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// Loads and authors migration units in a directory tree
#[derive(Debug, Clone)]
pub struct MigrationLoader {
    migrations_dir: PathBuf,
}

impl MigrationLoader {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.migrations_dir.clone())
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Load every unit, ascending by version.
    ///
    /// A unit with missing or malformed files is skipped and reported as a
    /// warning. A dependency cycle among the loaded units fails the load.
    pub fn load_all(&self) -> MigrationResult<LoadReport> {
        if !self.migrations_dir.exists() {
            tracing::debug!(
                "Migrations directory {} does not exist",
                self.migrations_dir.display()
            );
            return Ok(LoadReport::default());
        }

        let mut report = LoadReport::default();

        for dir in self.unit_dirs()? {
            let dir_name = dir_name(&dir);
            match self.load_unit(&dir) {
                Ok(unit) => report.units.push(unit),
                Err(e) => {
                    let reason = match e {
                        MigrationError::Load { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    tracing::warn!("Skipping migration {}: {}", dir_name, reason);
                    report.warnings.push(LoadWarning {
                        migration: dir_name,
                        reason,
                    });
                }
            }
        }

        report
            .units
            .sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.id.cmp(&b.id)));

        DependencyGraph::from_units(&report.units).ensure_acyclic()?;

        tracing::debug!(
            "Loaded {} migration(s), {} skipped",
            report.units.len(),
            report.warnings.len()
        );
        Ok(report)
    }

    /// Load one unit directory
    pub fn load_unit(&self, dir: &Path) -> MigrationResult<MigrationUnit> {
        let dir_name = dir_name(dir);
        let load_error = |reason: String| MigrationError::Load {
            migration: dir_name.clone(),
            reason,
        };

        let raw = fs::read_to_string(dir.join(METADATA_FILE))
            .map_err(|e| load_error(format!("cannot read {}: {}", METADATA_FILE, e)))?;
        let metadata: UnitMetadata = serde_json::from_str(&raw)
            .map_err(|e| load_error(format!("malformed {}: {}", METADATA_FILE, e)))?;

        if metadata.id != dir_name {
            return Err(load_error(format!(
                "id '{}' does not match directory name",
                metadata.id
            )));
        }
        if metadata.version.trim().is_empty() {
            return Err(load_error("version is empty".to_string()));
        }

        let up = fs::read_to_string(dir.join(UP_FILE))
            .map_err(|e| load_error(format!("cannot read {}: {}", UP_FILE, e)))?;
        let down = fs::read_to_string(dir.join(DOWN_FILE))
            .map_err(|e| load_error(format!("cannot read {}: {}", DOWN_FILE, e)))?;

        let checksum = compute_checksum(&up, &down);

        Ok(MigrationUnit {
            id: metadata.id,
            version: metadata.version,
            name: metadata.name,
            description: metadata.description,
            up,
            down,
            checksum,
            dependencies: metadata.dependencies,
            tags: metadata.tags,
        })
    }

    /// Author a new unit: allocate the next version, derive id and checksum,
    /// write the unit's files.
    pub fn create_unit(&self, new: NewMigration) -> MigrationResult<MigrationUnit> {
        let slug = slugify(&new.name);
        if slug.is_empty() {
            return Err(MigrationError::InvalidMigration(format!(
                "migration name '{}' has no usable characters",
                new.name
            )));
        }

        let loaded = self.load_all()?;
        for dependency in &new.dependencies {
            if loaded.find(dependency).is_none() {
                return Err(MigrationError::InvalidMigration(format!(
                    "unknown dependency '{}'",
                    dependency
                )));
            }
        }

        let version = self.next_version()?;
        let id = format!("{}_{}", version, slug);

        let unit = MigrationUnit {
            checksum: compute_checksum(&new.up, &new.down),
            id,
            version,
            name: new.name,
            description: new.description,
            up: new.up,
            down: new.down,
            dependencies: new.dependencies,
            tags: new.tags,
        };

        let dir = self.migrations_dir.join(&unit.id);
        fs::create_dir_all(&self.migrations_dir)?;
        fs::create_dir(&dir)?;
        fs::write(
            dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&unit.metadata())?,
        )?;
        fs::write(dir.join(UP_FILE), &unit.up)?;
        fs::write(dir.join(DOWN_FILE), &unit.down)?;

        tracing::info!("Created migration {}", unit.id);
        Ok(unit)
    }

    /// Current timestamp, bumped past any version already on disk
    fn next_version(&self) -> MigrationResult<String> {
        let candidate = Utc::now().format(VERSION_FORMAT).to_string();

        let latest = if self.migrations_dir.exists() {
            self.unit_dirs()?
                .iter()
                .filter_map(|dir| dir_name(dir).split('_').next().map(str::to_string))
                .max()
        } else {
            None
        };

        match latest {
            Some(latest) if latest >= candidate => {
                let bumped = latest.parse::<u64>().map_err(|_| {
                    MigrationError::InvalidMigration(format!(
                        "cannot allocate a version after non-numeric version '{}'",
                        latest
                    ))
                })? + 1;
                Ok(format!("{:0width$}", bumped, width = latest.len()))
            }
            _ => Ok(candidate),
        }
    }

    fn unit_dirs(&self) -> MigrationResult<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.migrations_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

/// Split a script into statements, each an exact slice of the original text.
///
/// Boundaries are top-level `;` tokens, so semicolons inside string
/// literals, quoted identifiers, comments, dollar-quoted bodies,
/// parentheses and `BEGIN ATOMIC ... END` blocks never split a statement.
/// Comments between statements are dropped; the statements themselves are
/// never re-rendered.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let dialect = PostgreSqlDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::warn!("Could not tokenize script, running it as one statement: {}", e);
            return if strip_comments(sql).trim().is_empty() {
                Vec::new()
            } else {
                vec![sql.trim().to_string()]
            };
        }
    };

    let offsets = LineOffsets::new(sql);
    let mut statements = Vec::new();
    let mut start: Option<usize> = None;
    let mut parens = 0usize;
    let mut atomic = AtomicBlock::default();
    let mut previous: Option<&Token> = None;

    for token in &tokens {
        match &token.token {
            Token::Whitespace(_) => continue,
            Token::SemiColon if parens == 0 && !atomic.open => {
                let end = offsets.byte_offset(token.location) + 1;
                if let Some(begin) = start.take() {
                    statements.push(sql[begin..end].trim().to_string());
                }
            }
            other => {
                if start.is_none() {
                    start = Some(offsets.byte_offset(token.location));
                }
                match other {
                    Token::LParen => parens += 1,
                    Token::RParen => parens = parens.saturating_sub(1),
                    Token::Word(word) => atomic.observe(word.keyword, previous),
                    _ => {}
                }
            }
        }
        previous = Some(&token.token);
    }

    if let Some(begin) = start {
        let tail = sql[begin..].trim();
        if !tail.is_empty() {
            statements.push(tail.to_string());
        }
    }

    statements
}

/// Tracks a SQL-standard function body, where `;` ends inner statements
#[derive(Default)]
struct AtomicBlock {
    open: bool,
    case_depth: usize,
}

impl AtomicBlock {
    fn observe(&mut self, keyword: Keyword, previous: Option<&Token>) {
        if !self.open {
            let after_begin = matches!(previous, Some(Token::Word(w)) if w.keyword == Keyword::BEGIN);
            if keyword == Keyword::ATOMIC && after_begin {
                self.open = true;
                self.case_depth = 0;
            }
            return;
        }

        match keyword {
            Keyword::CASE => self.case_depth += 1,
            Keyword::END if self.case_depth > 0 => self.case_depth -= 1,
            Keyword::END => self.open = false,
            _ => {}
        }
    }
}

/// Maps tokenizer locations (1-based line, 1-based char column) to byte offsets
struct LineOffsets<'a> {
    sql: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineOffsets<'a> {
    fn new(sql: &'a str) -> Self {
        let starts = std::iter::once(0)
            .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { sql, starts }
    }

    fn byte_offset(&self, location: Location) -> usize {
        let line = usize::try_from(location.line.saturating_sub(1)).unwrap_or(usize::MAX);
        let column = usize::try_from(location.column.saturating_sub(1)).unwrap_or(usize::MAX);
        let Some(&line_start) = self.starts.get(line) else {
            return self.sql.len();
        };
        self.sql[line_start..]
            .char_indices()
            .nth(column)
            .map(|(i, _)| line_start + i)
            .unwrap_or(self.sql.len())
    }
}

fn strip_comments(sql: &str) -> String {
    sql.lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_unit(root: &Path, id: &str, version: &str, deps: &[&str], up: &str, down: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        let metadata = UnitMetadata {
            id: id.to_string(),
            name: id.to_string(),
            version: version.to_string(),
            description: String::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            tags: vec!["schema".to_string()],
        };
        fs::write(dir.join(METADATA_FILE), serde_json::to_string(&metadata).unwrap()).unwrap();
        fs::write(dir.join(UP_FILE), up).unwrap();
        fs::write(dir.join(DOWN_FILE), down).unwrap();
    }

    #[test]
    fn test_load_sorted_by_version() {
        let temp_dir = TempDir::new().unwrap();
        write_unit(temp_dir.path(), "002_posts", "002", &["001_users"], "CREATE TABLE posts (id INT);", "DROP TABLE posts;");
        write_unit(temp_dir.path(), "001_users", "001", &[], "CREATE TABLE users (id INT);", "DROP TABLE users;");

        let report = MigrationLoader::new(temp_dir.path()).load_all().unwrap();
        assert!(report.warnings.is_empty());
        assert_eq!(report.units.len(), 2);
        assert_eq!(report.units[0].id, "001_users");
        assert_eq!(report.units[1].id, "002_posts");
        assert_eq!(report.units[1].dependencies, vec!["001_users".to_string()]);
        assert_eq!(
            report.units[0].checksum,
            compute_checksum("CREATE TABLE users (id INT);", "DROP TABLE users;")
        );
    }

    #[test]
    fn test_broken_unit_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        write_unit(temp_dir.path(), "001_users", "001", &[], "CREATE TABLE users (id INT);", "DROP TABLE users;");
        write_unit(temp_dir.path(), "002_broken", "002", &[], "CREATE TABLE b (id INT);", "DROP TABLE b;");
        fs::remove_file(temp_dir.path().join("002_broken").join(DOWN_FILE)).unwrap();

        let bad_json = temp_dir.path().join("003_bad_json");
        fs::create_dir_all(&bad_json).unwrap();
        fs::write(bad_json.join(METADATA_FILE), "{ not json").unwrap();

        // Stray files next to unit directories are ignored
        fs::write(temp_dir.path().join("README.md"), "notes").unwrap();

        let report = MigrationLoader::new(temp_dir.path()).load_all().unwrap();
        assert_eq!(report.units.len(), 1);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.warnings[0].migration, "002_broken");
        assert!(report.warnings[0].reason.contains(DOWN_FILE));
        assert!(report.warnings[1].reason.contains("malformed"));
    }

    #[test]
    fn test_id_must_match_directory() {
        let temp_dir = TempDir::new().unwrap();
        write_unit(temp_dir.path(), "001_users", "001", &[], "SELECT 1;", "SELECT 1;");
        fs::rename(temp_dir.path().join("001_users"), temp_dir.path().join("001_renamed")).unwrap();

        let report = MigrationLoader::new(temp_dir.path()).load_all().unwrap();
        assert!(report.units.is_empty());
        assert!(report.warnings[0].reason.contains("does not match"));
    }

    #[test]
    fn test_cycle_fails_load() {
        let temp_dir = TempDir::new().unwrap();
        write_unit(temp_dir.path(), "001_a", "001", &["002_b"], "SELECT 1;", "SELECT 1;");
        write_unit(temp_dir.path(), "002_b", "002", &["001_a"], "SELECT 1;", "SELECT 1;");

        let result = MigrationLoader::new(temp_dir.path()).load_all();
        assert!(matches!(result, Err(MigrationError::CyclicDependency { .. })));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let report = MigrationLoader::new(temp_dir.path().join("nope")).load_all().unwrap();
        assert!(report.units.is_empty());
    }

    #[test]
    fn test_create_unit_round_trips_through_loader() {
        let temp_dir = TempDir::new().unwrap();
        let loader = MigrationLoader::new(temp_dir.path());

        let users = loader
            .create_unit(
                NewMigration::new("Create Users Table")
                    .description("users")
                    .up("CREATE TABLE users (id INT);")
                    .down("DROP TABLE users;")
                    .tag("auth"),
            )
            .unwrap();
        assert!(users.id.ends_with("_create_users_table"));
        assert_eq!(users.version.len(), 14);

        let posts = loader
            .create_unit(
                NewMigration::new("posts")
                    .up("CREATE TABLE posts (id INT);")
                    .down("DROP TABLE posts;")
                    .depends_on(users.id.clone()),
            )
            .unwrap();
        assert!(posts.version > users.version);

        let report = loader.load_all().unwrap();
        assert_eq!(report.units, vec![users, posts]);
    }

    #[test]
    fn test_create_unit_rejects_unknown_dependency() {
        let temp_dir = TempDir::new().unwrap();
        let loader = MigrationLoader::new(temp_dir.path());
        let result = loader.create_unit(NewMigration::new("orphan").depends_on("missing"));
        assert!(matches!(result, Err(MigrationError::InvalidMigration(_))));

        let result = loader.create_unit(NewMigration::new("  !!  "));
        assert!(matches!(result, Err(MigrationError::InvalidMigration(_))));
    }

    #[test]
    fn test_version_bumps_past_future_versions() {
        let temp_dir = TempDir::new().unwrap();
        write_unit(temp_dir.path(), "99990101000000_future", "99990101000000", &[], "SELECT 1;", "SELECT 1;");
        let loader = MigrationLoader::new(temp_dir.path());
        let unit = loader.create_unit(NewMigration::new("next")).unwrap();
        assert_eq!(unit.version, "99990101000001");
    }

    #[test]
    fn test_split_sql_statements() {
        let statements = split_sql_statements(
            "-- create things\nCREATE TABLE a (id INT);\nCREATE INDEX idx_a ON a (id);",
        );
        assert_eq!(
            statements,
            vec!["CREATE TABLE a (id INT);", "CREATE INDEX idx_a ON a (id);"]
        );

        assert!(split_sql_statements("-- nothing here\n\n").is_empty());
        assert!(split_sql_statements("/* block */ ;").is_empty());
    }

    #[test]
    fn test_split_keeps_do_blocks_whole() {
        let do_block = "DO $$\nBEGIN\n  IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = 'app') THEN\n    CREATE ROLE app;\n  END IF;\nEND\n$$;";
        let sql = format!("{}\n\nCREATE TABLE accounts (id BIGSERIAL PRIMARY KEY);\n", do_block);

        let statements = split_sql_statements(&sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], do_block);
        assert_eq!(statements[1], "CREATE TABLE accounts (id BIGSERIAL PRIMARY KEY);");
    }

    #[test]
    fn test_split_keeps_function_text_verbatim() {
        let function = "CREATE FUNCTION touch() RETURNS trigger LANGUAGE plpgsql AS $body$\nBEGIN\n  NEW.updated_at := now();\n  RETURN NEW;\nEND;\n$body$;";
        let trigger = "CREATE TRIGGER accounts_touch BEFORE UPDATE ON accounts\n  FOR EACH ROW EXECUTE FUNCTION touch();";
        let sql = format!("-- keep updated_at current\n{}\n{}\n", function, trigger);

        let statements = split_sql_statements(&sql);
        assert_eq!(statements, vec![function.to_string(), trigger.to_string()]);
    }

    #[test]
    fn test_split_ignores_semicolons_in_literals_and_blocks() {
        let sql = "INSERT INTO notes (body) VALUES ('a; b'), ('c;; d');\n\
                   COMMENT ON TABLE \"odd;name\" IS 'x;y';\n\
                   CREATE RULE keep AS ON DELETE TO notes DO INSTEAD (UPDATE notes SET body = ''; SELECT 1);\n\
                   CREATE FUNCTION one() RETURNS int LANGUAGE sql\n\
                   BEGIN ATOMIC\n  SELECT CASE WHEN true THEN 1 ELSE 0 END;\nEND;\n\
                   SELECT 2";

        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 5);
        assert!(statements[0].ends_with("('c;; d');"));
        assert!(statements[1].starts_with("COMMENT ON TABLE \"odd;name\""));
        assert!(statements[2].ends_with("SELECT 1);"));
        assert!(statements[3].starts_with("CREATE FUNCTION one()"));
        assert!(statements[3].ends_with("END;"));
        assert_eq!(statements[4], "SELECT 2");
    }

    #[test]
    fn test_split_handles_multibyte_text() {
        let statements = split_sql_statements("INSERT INTO t VALUES ('é; ü');\nSELECT 'ß';");
        assert_eq!(statements, vec!["INSERT INTO t VALUES ('é; ü');", "SELECT 'ß';"]);
    }
}
