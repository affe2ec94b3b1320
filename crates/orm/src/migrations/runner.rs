//! Migration Runner - Executes migrations against the database
//!
//! Pending migrations are the discovered files the ledger has not recorded,
//! in filename order. Each one runs in its own transaction together with its
//! ledger insert, so a failing file leaves neither schema changes nor a
//! ledger row behind. The run stops at the first failure.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use super::definitions::{MigrationConfig, MigrationRunResult, MigrationStatusReport};
use super::ledger::MigrationLedger;
use super::manager::MigrationManager;
use crate::connection::ManagedPool;
use crate::error::OrmResult;

/// Migration runner that executes migrations against a database
pub struct MigrationRunner {
    pub(super) manager: MigrationManager,
    pub(super) ledger: MigrationLedger,
    pub(super) pool: Arc<ManagedPool>,
}

impl MigrationRunner {
    /// Create a runner for `config` on `pool`
    pub fn new(config: MigrationConfig, pool: Arc<ManagedPool>) -> OrmResult<Self> {
        config.validate()?;
        let ledger = MigrationLedger::new(Arc::clone(&pool), config.migrations_table.clone());
        Ok(Self {
            manager: MigrationManager::with_config(config),
            ledger,
            pool,
        })
    }

    pub fn pool(&self) -> &ManagedPool {
        &self.pool
    }

    pub fn manager(&self) -> &MigrationManager {
        &self.manager
    }

    pub fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    /// Migration files on disk, sorted
    pub fn discover(&self) -> OrmResult<Vec<String>> {
        self.manager.discover()
    }

    /// Files that have not been applied yet, in apply order
    pub async fn diff_pending(&self) -> OrmResult<Vec<String>> {
        self.ledger.ensure_table().await?;
        let discovered = self.discover()?;
        let applied = self.ledger.list_applied().await?;
        Ok(pending_migrations(&discovered, &applied))
    }

    /// Apply every pending migration
    pub async fn apply_pending(&self) -> OrmResult<MigrationRunResult> {
        let start_time = Instant::now();

        self.ledger.ensure_table().await?;
        let discovered = self.discover()?;
        let applied = self.ledger.list_applied().await?;
        let pending = pending_migrations(&discovered, &applied);
        let skipped_count = discovered.len() - pending.len();

        if pending.is_empty() {
            info!("No pending migrations");
            return Ok(MigrationRunResult {
                applied_count: 0,
                applied_migrations: Vec::new(),
                skipped_count,
                execution_time_ms: start_time.elapsed().as_millis(),
            });
        }

        // Parse everything up front so a malformed file aborts before any
        // migration runs.
        let files = pending
            .iter()
            .map(|filename| self.manager.load(filename))
            .collect::<OrmResult<Vec<_>>>()?;

        info!("Applying {} pending migration(s)", files.len());

        let mut applied_migrations = Vec::with_capacity(files.len());
        for file in files {
            let migration_start = Instant::now();
            let context = format!("Applying {}", file.filename);

            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| e.with_context(context.clone()))?;
            let outcome = match tx.execute(&file.apply, &[]).await {
                Ok(_) => self.ledger.record_applied(&file.filename, &mut tx).await,
                Err(e) => Err(e),
            };
            tx.finish(outcome)
                .await
                .map_err(|e| e.with_context(context))?;

            info!(
                migration = %file.filename,
                duration_ms = migration_start.elapsed().as_millis() as u64,
                "Applied migration"
            );
            applied_migrations.push(file.filename);
        }

        Ok(MigrationRunResult {
            applied_count: applied_migrations.len(),
            applied_migrations,
            skipped_count,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }

    /// Write a new migration file from the template and return its filename
    pub fn create(&self, name: &str) -> OrmResult<String> {
        self.manager.create_migration(name)
    }

    /// Applied records and pending files
    pub async fn status(&self) -> OrmResult<MigrationStatusReport> {
        self.ledger.ensure_table().await?;
        let discovered = self.discover()?;
        let applied = self.ledger.records().await?;
        let applied_names: Vec<String> = applied.iter().map(|r| r.filename.clone()).collect();

        Ok(MigrationStatusReport {
            pending: pending_migrations(&discovered, &applied_names),
            applied,
        })
    }
}

/// Discovered filenames absent from `applied`, keeping discovery order
pub fn pending_migrations(discovered: &[String], applied: &[String]) -> Vec<String> {
    let applied: HashSet<&str> = applied.iter().map(String::as_str).collect();
    discovered
        .iter()
        .filter(|filename| !applied.contains(filename.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pending_is_set_difference_in_order() {
        let discovered = names(&["001_a.sql", "002_b.sql", "003_c.sql", "004_d.sql"]);
        let applied = names(&["003_c.sql", "001_a.sql", "999_gone.sql"]);

        assert_eq!(
            pending_migrations(&discovered, &applied),
            names(&["002_b.sql", "004_d.sql"])
        );
    }

    #[test]
    fn test_nothing_pending() {
        let discovered = names(&["001_a.sql"]);
        assert!(pending_migrations(&discovered, &discovered).is_empty());
        assert!(pending_migrations(&[], &discovered).is_empty());
    }
}
