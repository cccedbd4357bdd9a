use chrono::Utc;
use elif_migrations::{Direction, MigrationRollback, NewMigration};

use super::Context;
use crate::output;

/// Template written when no script is supplied
pub fn script_template(name: &str, direction: Direction) -> String {
    let body = match direction {
        Direction::Up => "-- Forward change",
        Direction::Down => "-- Reverse of the forward change; leave empty if it cannot be undone",
    };
    format!(
        "-- Migration: {}\n-- Created: {}\n\n{}\n",
        name,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        body
    )
}

pub async fn create(
    ctx: &Context,
    name: &str,
    description: Option<String>,
    depends_on: Vec<String>,
    tags: Vec<String>,
) -> anyhow::Result<bool> {
    let mut new = NewMigration::new(name)
        .up(script_template(name, Direction::Up))
        .down(script_template(name, Direction::Down));
    if let Some(description) = description {
        new = new.description(description);
    }
    for dependency in depends_on {
        new = new.depends_on(dependency);
    }
    for tag in tags {
        new = new.tag(tag);
    }

    let loader = ctx.loader();
    let unit = loader.create_unit(new)?;

    if ctx.json {
        output::print_json(&unit.metadata())?;
    } else {
        output::print_created(&unit, &loader.migrations_dir().join(&unit.id));
    }
    Ok(true)
}

pub async fn status(ctx: &Context) -> anyhow::Result<bool> {
    let migrator = ctx.connect().await?;
    let status = migrator.status().await?;

    if ctx.json {
        output::print_json(&status)?;
    } else {
        output::print_status(&status);
    }
    Ok(true)
}

pub async fn plan(ctx: &Context, target: Option<String>, down: bool) -> anyhow::Result<bool> {
    let migrator = ctx.connect().await?;
    let direction = if down { Direction::Down } else { Direction::Up };
    let plan = migrator.plan(target.as_deref(), direction, true).await?;

    if ctx.json {
        output::print_json(&plan)?;
    } else {
        output::print_plan(&plan);
    }
    Ok(true)
}

pub async fn up(ctx: &Context, target: Option<String>, dry_run: bool) -> anyhow::Result<bool> {
    let migrator = ctx.connect().await?;
    let execution = migrator.migrate(target.as_deref(), dry_run).await?;
    report(ctx, &execution)
}

pub async fn down(ctx: &Context, target: Option<String>, dry_run: bool) -> anyhow::Result<bool> {
    let migrator = ctx.connect().await?;
    let execution = migrator.rollback(target.as_deref(), dry_run).await?;
    report(ctx, &execution)
}

pub async fn rollback_last(ctx: &Context, count: usize, dry_run: bool) -> anyhow::Result<bool> {
    let migrator = ctx.connect().await?;
    let execution = migrator.rollback_last(count, dry_run).await?;
    report(ctx, &execution)
}

pub async fn validate(ctx: &Context) -> anyhow::Result<bool> {
    let migrator = ctx.connect().await?;
    let report = migrator.validate().await?;

    if ctx.json {
        output::print_json(&report)?;
    } else {
        output::print_integrity(&report);
    }
    Ok(report.valid)
}

pub async fn history(ctx: &Context, limit: usize) -> anyhow::Result<bool> {
    let migrator = ctx.connect().await?;
    let entries = migrator.history(limit).await?;

    if ctx.json {
        output::print_json(&entries)?;
    } else {
        output::print_history(&entries);
    }
    Ok(true)
}

fn report(ctx: &Context, execution: &elif_migrations::PlanExecution) -> anyhow::Result<bool> {
    if ctx.json {
        output::print_json(execution)?;
    } else {
        output::print_execution(execution);
    }
    Ok(execution.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use elif_migrations::{MigrationConfig, MigrationLoader};

    fn context(dir: &std::path::Path) -> Context {
        Context {
            config: MigrationConfig::default().with_migrations_dir(dir),
            database_url: None,
            json: true,
        }
    }

    #[test]
    fn test_down_template_is_not_reversible_until_edited() {
        let unit = elif_migrations::MigrationUnit {
            id: "1_x".to_string(),
            version: "1".to_string(),
            name: "x".to_string(),
            description: String::new(),
            up: script_template("x", Direction::Up),
            down: script_template("x", Direction::Down),
            checksum: String::new(),
            dependencies: Vec::new(),
            tags: Vec::new(),
        };
        assert!(!unit.is_reversible());
    }

    #[tokio::test]
    async fn test_create_writes_unit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        assert!(create(&ctx, "add users", Some("users table".to_string()), Vec::new(), vec!["core".to_string()])
            .await
            .unwrap());

        let report = MigrationLoader::new(dir.path()).load_all().unwrap();
        assert_eq!(report.units.len(), 1);
        let unit = &report.units[0];
        assert!(unit.id.ends_with("_add_users"));
        assert_eq!(unit.description, "users table");
        assert_eq!(unit.tags, vec!["core".to_string()]);
        assert!(unit.up.starts_with("-- Migration: add users"));
    }

    #[tokio::test]
    async fn test_commands_need_a_database_url() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let err = status(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
