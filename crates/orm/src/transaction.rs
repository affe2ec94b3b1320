//! Transaction Management
//!
//! A [`Transaction`] owns a pooled lease between `BEGIN` and
//! `COMMIT`/`ROLLBACK`. [`Transaction::finish`] turns an operation result into
//! the matching outcome: commit on `Ok`, roll back and propagate on `Err`.

use crate::backends::{DatabaseRow, DatabaseValue};
use crate::connection::{ManagedPool, PooledConnection};
use crate::error::{ClassifiedError, OrmResult};
use futures::future::BoxFuture;
use tracing::{debug, warn};

/// Transaction isolation levels supported by PostgreSQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION ISOLATION LEVEL command
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Transaction configuration options
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    /// `None` keeps the server default (READ COMMITTED)
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: bool,
}

/// An open transaction on an exclusive lease
pub struct Transaction {
    conn: Option<PooledConnection>,
    config: TransactionConfig,
    committed: bool,
}

impl Transaction {
    /// Issue `BEGIN` on `conn` and apply `config`
    pub(crate) async fn begin(
        mut conn: PooledConnection,
        config: TransactionConfig,
    ) -> OrmResult<Self> {
        debug!("Beginning transaction with config: {:?}", config);

        conn.execute("BEGIN", &[]).await?;
        conn.set_in_transaction(true);

        let mut tx = Transaction {
            conn: Some(conn),
            config,
            committed: false,
        };

        if let Some(isolation_level) = tx.config.isolation_level {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation_level.as_sql());
            tx.execute(&sql, &[]).await?;
        }

        if tx.config.read_only {
            tx.execute("SET TRANSACTION READ ONLY", &[]).await?;
        }

        Ok(tx)
    }

    fn connection(&mut self) -> OrmResult<&mut PooledConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| ClassifiedError::unexpected("Transaction has already been consumed"))
    }

    pub async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        self.connection()?.execute(sql, params).await
    }

    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<DatabaseRow>> {
        self.connection()?.fetch_all(sql, params).await
    }

    /// Commit the transaction
    pub async fn commit(mut self) -> OrmResult<()> {
        let mut conn = self.take_connection()?;
        debug!("Committing transaction");
        // On failure the lease still reports an open transaction and is
        // discarded instead of returned.
        conn.execute("COMMIT", &[]).await?;
        conn.set_in_transaction(false);
        self.committed = true;
        Ok(())
    }

    /// Rollback the transaction
    pub async fn rollback(mut self) -> OrmResult<()> {
        let mut conn = self.take_connection()?;
        debug!("Rolling back transaction");
        conn.execute("ROLLBACK", &[]).await?;
        conn.set_in_transaction(false);
        Ok(())
    }

    /// Commit if `outcome` is `Ok`, otherwise roll back and return the error
    pub async fn finish<T>(self, outcome: OrmResult<T>) -> OrmResult<T> {
        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(
                        "Rollback failed after '{}': {}; the connection was discarded",
                        err, rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    fn take_connection(&mut self) -> OrmResult<PooledConnection> {
        self.conn
            .take()
            .ok_or_else(|| ClassifiedError::unexpected("Transaction has already been consumed"))
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Check if the transaction is still active (not committed or rolled back)
    pub fn is_active(&self) -> bool {
        self.conn.is_some()
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("config", &self.config)
            .field("active", &self.is_active())
            .field("committed", &self.committed)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.conn.is_some() {
            // The lease is discarded on drop, which aborts the transaction
            // server-side.
            warn!("Transaction dropped without commit or rollback; discarding its connection");
        }
    }
}

/// Run `f` inside a transaction on `pool`, committing on success
pub async fn with_transaction<F, R>(pool: &ManagedPool, f: F) -> OrmResult<R>
where
    F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, OrmResult<R>>,
{
    let mut tx = pool.begin().await?;
    let outcome = f(&mut tx).await;
    tx.finish(outcome).await
}
