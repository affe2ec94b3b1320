//! Migration Rollback - Reversing the most recent migration

use std::time::Instant;

use tracing::info;

use super::definitions::RollbackResult;
use super::runner::MigrationRunner;
use crate::error::{ClassifiedError, OrmResult};

impl MigrationRunner {
    /// Reverse the most recently applied migration.
    ///
    /// The rollback SQL and the ledger delete share one transaction.
    pub async fn reverse_last(&self) -> OrmResult<RollbackResult> {
        let start_time = Instant::now();

        self.ledger.ensure_table().await?;
        let filename = self
            .ledger
            .last_applied()
            .await?
            .ok_or_else(ClassifiedError::no_migrations_applied)?;

        let file = self.manager.load(&filename)?;
        let rollback_sql = file
            .rollback
            .as_deref()
            .ok_or_else(|| ClassifiedError::no_rollback_section(&filename))?;

        let context = format!("Rolling back {}", filename);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| e.with_context(context.clone()))?;
        let outcome = match tx.execute(rollback_sql, &[]).await {
            Ok(_) => self.ledger.remove_applied(&filename, &mut tx).await,
            Err(e) => Err(e),
        };
        tx.finish(outcome)
            .await
            .map_err(|e| e.with_context(context))?;

        info!(migration = %filename, "Rolled back migration");

        Ok(RollbackResult {
            rolled_back: filename,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}
