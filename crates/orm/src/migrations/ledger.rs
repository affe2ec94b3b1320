//! Migration ledger
//!
//! The ledger table records one row per applied migration. Rows are ordered
//! by their serial id, which is the order they were applied in.

use std::sync::Arc;

use futures::FutureExt;

use super::definitions::MigrationRecord;
use crate::backends::DatabaseValue;
use crate::connection::ManagedPool;
use crate::error::{ClassifiedError, ErrorKind, OrmResult};
use crate::transaction::Transaction;

pub struct MigrationLedger {
    pool: Arc<ManagedPool>,
    table: String,
}

impl MigrationLedger {
    /// `table` must already be a validated identifier
    pub fn new(pool: Arc<ManagedPool>, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id BIGSERIAL PRIMARY KEY, \
             filename VARCHAR(255) NOT NULL UNIQUE, \
             executed_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP)",
            self.table
        )
    }

    /// Create the ledger table if it does not exist
    pub async fn ensure_table(&self) -> OrmResult<()> {
        let sql = self.create_table_sql();
        self.pool
            .run_exclusive(move |conn| {
                async move {
                    conn.execute(&sql, &[]).await?;
                    Ok(())
                }
                .boxed()
            })
            .await
            .map_err(|e| e.with_context("Creating migrations table"))
    }

    /// Applied filenames in application order
    pub async fn list_applied(&self) -> OrmResult<Vec<String>> {
        let sql = format!("SELECT filename FROM {} ORDER BY id ASC", self.table);
        self.pool
            .fetch_all(&sql, &[])
            .await?
            .iter()
            .map(|row| row.get_string("filename"))
            .collect()
    }

    /// Full ledger rows in application order
    pub async fn records(&self) -> OrmResult<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT filename, executed_at FROM {} ORDER BY id ASC",
            self.table
        );
        self.pool
            .fetch_all(&sql, &[])
            .await?
            .iter()
            .map(MigrationRecord::from_row)
            .collect()
    }

    /// The most recently applied filename, if any
    pub async fn last_applied(&self) -> OrmResult<Option<String>> {
        let sql = format!(
            "SELECT filename FROM {} ORDER BY id DESC LIMIT 1",
            self.table
        );
        match self.pool.fetch_all(&sql, &[]).await?.first() {
            Some(row) => Ok(Some(row.get_string("filename")?)),
            None => Ok(None),
        }
    }

    /// Record `filename` inside the caller's transaction
    pub async fn record_applied(&self, filename: &str, tx: &mut Transaction) -> OrmResult<()> {
        let sql = format!("INSERT INTO {} (filename) VALUES ($1)", self.table);
        tx.execute(&sql, &[DatabaseValue::from(filename)])
            .await
            .map(|_| ())
            .map_err(|e| match e.kind() {
                ErrorKind::ConstraintViolation(crate::error::ConstraintKind::Unique) => {
                    ClassifiedError::migration_already_applied(filename)
                        .with_detail(e.detail().unwrap_or_else(|| e.message()).to_string())
                }
                _ => e,
            })
    }

    /// Remove `filename` inside the caller's transaction
    pub async fn remove_applied(&self, filename: &str, tx: &mut Transaction) -> OrmResult<()> {
        let sql = format!("DELETE FROM {} WHERE filename = $1", self.table);
        let removed = tx.execute(&sql, &[DatabaseValue::from(filename)]).await?;
        if removed == 0 {
            tracing::warn!("Ledger had no row for {}", filename);
        }
        Ok(())
    }
}
