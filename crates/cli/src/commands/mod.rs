pub mod migrate;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use elif_migrations::{MigrationConfig, MigrationLoader, Migrator, PostgresExecutor};

/// Settings shared by every subcommand
pub struct Context {
    pub config: MigrationConfig,
    pub database_url: Option<String>,
    pub json: bool,
}

impl Context {
    /// Environment first, then command line overrides
    pub fn new(
        database_url: Option<String>,
        dir: Option<PathBuf>,
        table: Option<String>,
        json: bool,
    ) -> anyhow::Result<Self> {
        let mut config = MigrationConfig::from_env().context("Invalid migration configuration")?;
        if let Some(dir) = dir {
            config = config.with_migrations_dir(dir);
        }
        if let Some(table) = table {
            config = config.with_ledger_table(table);
        }
        config.validate().context("Invalid migration configuration")?;

        Ok(Self {
            config,
            database_url,
            json,
        })
    }

    /// Loader for commands that never touch the database
    pub fn loader(&self) -> MigrationLoader {
        MigrationLoader::from_config(&self.config)
    }

    /// Connect to the database and make sure the ledger table exists
    pub async fn connect(&self) -> anyhow::Result<Migrator> {
        let Some(url) = self.database_url.as_deref() else {
            bail!("No database URL; pass --database-url or set DATABASE_URL");
        };

        tracing::debug!(
            "Connecting with ledger table {} and migrations in {}",
            self.config.ledger_table,
            self.config.migrations_dir.display()
        );
        let executor = PostgresExecutor::connect(url, &self.config)
            .await
            .context("Could not connect to the database")?;
        let migrator = Migrator::new(self.config.clone(), Arc::new(executor));
        migrator
            .initialize()
            .await
            .context("Could not prepare the ledger table")?;
        Ok(migrator)
    }
}
