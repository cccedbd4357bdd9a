//! PostgreSQL Backend Implementation
//!
//! Runs migration transactions on a sqlx `PgPool`. Every transaction gets
//! `SET LOCAL lock_timeout` / `statement_timeout` from configuration so a
//! blocked migration fails instead of hanging the deploy.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};

use super::core::{MigrationTransaction, TransactionalExecutor};
use crate::config::MigrationConfig;
use crate::definitions::LedgerEntry;
use crate::error::{MigrationError, MigrationResult};

/// PostgreSQL transactional executor
#[derive(Debug, Clone)]
pub struct PostgresExecutor {
    pool: PgPool,
    lock_timeout_ms: u64,
    statement_timeout_ms: u64,
}

impl PostgresExecutor {
    pub fn new(pool: PgPool, config: &MigrationConfig) -> Self {
        Self {
            pool,
            lock_timeout_ms: config.lock_timeout_ms,
            statement_timeout_ms: config.statement_timeout_ms,
        }
    }

    /// Connect a small pool; migrations run one transaction at a time
    pub async fn connect(database_url: &str, config: &MigrationConfig) -> MigrationResult<Self> {
        if !database_url.starts_with("postgresql://") && !database_url.starts_with("postgres://") {
            return Err(MigrationError::database("Invalid PostgreSQL URL scheme"));
        }

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| MigrationError::database_context("Failed to connect to database", e))?;

        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn index_name(table: &str, column: &str) -> String {
    format!("idx_{}_{}", table.replace('.', "_"), column)
}

fn create_ledger_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
            id VARCHAR(255) PRIMARY KEY,\n    \
            name TEXT NOT NULL,\n    \
            version VARCHAR(64) NOT NULL,\n    \
            description TEXT NOT NULL DEFAULT '',\n    \
            checksum VARCHAR(128) NOT NULL,\n    \
            applied_at TIMESTAMPTZ NOT NULL,\n    \
            rolled_back_at TIMESTAMPTZ NULL,\n    \
            execution_time BIGINT NOT NULL DEFAULT 0,\n    \
            dependencies TEXT[] NOT NULL DEFAULT '{{}}',\n    \
            tags TEXT[] NOT NULL DEFAULT '{{}}'\n\
        )",
        table
    )
}

fn upsert_ledger_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (id, name, version, description, checksum, applied_at, rolled_back_at, \
         execution_time, dependencies, tags) \
         VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8, $9) \
         ON CONFLICT (id) DO UPDATE SET \
         name = EXCLUDED.name, version = EXCLUDED.version, description = EXCLUDED.description, \
         checksum = EXCLUDED.checksum, applied_at = EXCLUDED.applied_at, rolled_back_at = NULL, \
         execution_time = EXCLUDED.execution_time, dependencies = EXCLUDED.dependencies, \
         tags = EXCLUDED.tags",
        table
    )
}

#[async_trait]
impl TransactionalExecutor for PostgresExecutor {
    async fn ensure_ledger(&self, table: &str) -> MigrationResult<()> {
        let statements = [
            create_ledger_table_sql(table),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (version)",
                index_name(table, "version"),
                table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (applied_at)",
                index_name(table, "applied_at"),
                table
            ),
        ];

        for sql in &statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| MigrationError::database_context("Failed to create ledger table", e))?;
        }
        Ok(())
    }

    async fn fetch_ledger(&self, table: &str) -> MigrationResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT id, name, version, description, checksum, applied_at, rolled_back_at, \
             execution_time, dependencies, tags FROM {} ORDER BY applied_at, id",
            table
        );

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrationError::database_context("Failed to query ledger", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(LedgerEntry {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                version: row.try_get("version")?,
                description: row.try_get("description")?,
                checksum: row.try_get("checksum")?,
                applied_at: row.try_get("applied_at")?,
                rolled_back_at: row.try_get("rolled_back_at")?,
                execution_time_ms: row.try_get("execution_time")?,
                dependencies: row.try_get("dependencies")?,
                tags: row.try_get("tags")?,
            });
        }
        Ok(entries)
    }

    async fn begin(&self) -> MigrationResult<Box<dyn MigrationTransaction>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MigrationError::transaction_context("Failed to start transaction", e))?;

        if self.lock_timeout_ms > 0 {
            let sql = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms);
            (&mut *tx)
                .execute(sql.as_str())
                .await
                .map_err(|e| MigrationError::transaction_context("Failed to set lock_timeout", e))?;
        }

        if self.statement_timeout_ms > 0 {
            let sql = format!("SET LOCAL statement_timeout = '{}ms'", self.statement_timeout_ms);
            (&mut *tx).execute(sql.as_str()).await.map_err(|e| {
                MigrationError::transaction_context("Failed to set statement_timeout", e)
            })?;
        }

        tracing::debug!("PostgreSQL migration transaction started");
        Ok(Box::new(PostgresTransaction { tx }))
    }

    fn backend_name(&self) -> &'static str {
        "postgresql"
    }
}

/// PostgreSQL migration transaction
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MigrationTransaction for PostgresTransaction {
    async fn execute(&mut self, sql: &str) -> MigrationResult<u64> {
        // No bind parameters, so sqlx uses the simple query protocol
        let result = (&mut *self.tx).execute(sql).await?;
        Ok(result.rows_affected())
    }

    async fn upsert_ledger_entry(&mut self, table: &str, entry: &LedgerEntry) -> MigrationResult<()> {
        sqlx::query(&upsert_ledger_sql(table))
            .bind(&entry.id)
            .bind(&entry.name)
            .bind(&entry.version)
            .bind(&entry.description)
            .bind(&entry.checksum)
            .bind(entry.applied_at)
            .bind(entry.execution_time_ms)
            .bind(&entry.dependencies)
            .bind(&entry.tags)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| MigrationError::database_context("Failed to record migration", e))?;
        Ok(())
    }

    async fn mark_rolled_back(
        &mut self,
        table: &str,
        id: &str,
        rolled_back_at: DateTime<Utc>,
    ) -> MigrationResult<()> {
        let sql = format!("UPDATE {} SET rolled_back_at = $2 WHERE id = $1", table);
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(rolled_back_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| MigrationError::database_context("Failed to record rollback", e))?;

        if result.rows_affected() == 0 {
            return Err(MigrationError::database(format!(
                "No ledger row for migration {}",
                id
            )));
        }
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> MigrationResult<()> {
        self.execute(&format!("SAVEPOINT {}", name)).await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> MigrationResult<()> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", name)).await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> MigrationResult<()> {
        self.execute(&format!("RELEASE SAVEPOINT {}", name)).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> MigrationResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| MigrationError::transaction_context("Failed to commit migration", e))
    }

    async fn rollback(self: Box<Self>) -> MigrationResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| MigrationError::transaction_context("Failed to roll back migration", e))
    }
}
