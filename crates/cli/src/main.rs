mod commands;
mod logging;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;

use commands::{migrate, Context};

/// Only one run may target a database at a time; serialize deploys or take
/// an advisory lock before invoking this tool.
#[derive(Parser)]
#[command(name = "elif-migrate")]
#[command(about = "Reversible schema migrations for elif.rs", version)]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Migrations directory (overrides MIGRATIONS_DIR)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Ledger table name (overrides MIGRATIONS_TABLE)
    #[arg(long, global = true)]
    table: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging for the migration engine
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new migration
    Create {
        /// Migration name
        name: String,

        /// Human readable description
        #[arg(long)]
        description: Option<String>,

        /// Id of a migration that must be applied first
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Free-form tag
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Show migration status
    Status,

    /// Show what would run, without running it
    Plan {
        /// Stop at (up) or roll back to (down) this version
        #[arg(long)]
        target: Option<String>,

        /// Plan a rollback instead of an upgrade
        #[arg(long)]
        down: bool,
    },

    /// Apply pending migrations
    Up {
        /// Apply up to and including this version
        #[arg(long)]
        target: Option<String>,

        /// Preview statements without executing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back applied migrations
    Down {
        /// Keep this version and everything below it; all migrations when omitted
        #[arg(long)]
        target: Option<String>,

        /// Preview statements without executing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back the most recently applied migrations
    RollbackLast {
        /// Number of migrations to roll back
        count: usize,

        /// Preview statements without executing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Check the ledger against the migration files
    Validate,

    /// Show applied and rolled back migrations, most recent first
    History {
        /// Maximum number of entries
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let ctx = Context::new(cli.database_url, cli.dir, cli.table, cli.json)?;

    match cli.command {
        Commands::Create {
            name,
            description,
            depends_on,
            tags,
        } => migrate::create(&ctx, &name, description, depends_on, tags).await,
        Commands::Status => migrate::status(&ctx).await,
        Commands::Plan { target, down } => migrate::plan(&ctx, target, down).await,
        Commands::Up { target, dry_run } => migrate::up(&ctx, target, dry_run).await,
        Commands::Down { target, dry_run } => migrate::down(&ctx, target, dry_run).await,
        Commands::RollbackLast { count, dry_run } => {
            migrate::rollback_last(&ctx, count, dry_run).await
        }
        Commands::Validate => migrate::validate(&ctx).await,
        Commands::History { limit } => migrate::history(&ctx, limit).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
