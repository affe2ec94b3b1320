//! # strata-orm: database layer for strata
//!
//! A managed connection pool over sqlx's pool, transactions with an
//! explicit commit/rollback outcome, a classifier that maps every storage
//! failure into one error taxonomy, and the migration ledger and runner
//! built on top of them.

pub mod backends;
pub mod connection;
pub mod error;
pub mod migrations;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use backends::{
    DatabaseBackendType, DatabaseConnection, DatabasePool, DatabaseRow, DatabaseValue,
    PostgresConnection, PostgresPool,
};
#[cfg(any(test, feature = "testing"))]
pub use backends::{MemoryConnection, MemoryDatabase, MemoryPool};
pub use connection::{
    DatabaseStatus, HealthSnapshot, HealthStatus, ManagedPool, PoolConfig, PoolHealthReport,
    PoolStats, PooledConnection,
};
pub use error::{
    classify, report, ClassifiedError, ConstraintKind, ErrorKind, OrmError, OrmResult, RawFailure,
    StatusClass,
};
pub use migrations::{
    MigrationConfig, MigrationFile, MigrationManager, MigrationRecord, MigrationRunResult,
    MigrationRunner, MigrationStatusReport, RollbackResult,
};
pub use transaction::{with_transaction, IsolationLevel, Transaction, TransactionConfig};
