//! Connection Pool Management
//!
//! Bounding, idle reclamation and acquire timeouts belong to the backend
//! [`DatabasePool`] (sqlx's pool for PostgreSQL). [`ManagedPool`] wraps it
//! with lease counting, acquire statistics and per-statement logging.
//! Leases are [`PooledConnection`]s and go back to the pool when dropped.

use super::health::PoolHealthReport;
use super::statistics::PoolStats;
use crate::backends::{DatabaseConnection, DatabasePool, DatabaseRow, DatabaseValue, PostgresPool};
use crate::error::{ClassifiedError, ErrorKind, OrmResult};
use crate::transaction::{Transaction, TransactionConfig};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::DatabaseConfig;

/// Pool sizing and timeouts
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on leased plus idle connections
    pub max_connections: u32,
    /// Idle connections older than this are closed; `None` keeps them forever
    pub idle_timeout: Option<Duration>,
    /// How long `acquire` may wait for a slot and a connection
    pub acquire_timeout: Duration,
    /// Log raw parameter values with each statement
    pub log_query_params: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            idle_timeout: Some(Duration::from_secs(30)),
            acquire_timeout: Duration::from_secs(2),
            log_query_params: false,
        }
    }
}

impl From<&DatabaseConfig> for PoolConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            idle_timeout: config.idle_timeout,
            acquire_timeout: config.acquire_timeout,
            log_query_params: config.log_query_params,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> OrmResult<()> {
        if self.max_connections == 0 {
            return Err(ClassifiedError::new(
                ErrorKind::Misconfiguration,
                "Pool max_connections must be at least 1",
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ClassifiedError::new(
                ErrorKind::Misconfiguration,
                "Pool acquire_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Backend pool wrapped with lease accounting, statement logging and
/// health checks
pub struct ManagedPool {
    pool: Arc<dyn DatabasePool>,
    config: PoolConfig,
    leased: Arc<AtomicU32>,
    acquire_count: AtomicU64,
    acquire_errors: AtomicU64,
    created_at: Instant,
}

impl ManagedPool {
    /// Wrap a backend pool built from the same `config`
    pub fn new(pool: Arc<dyn DatabasePool>, config: PoolConfig) -> OrmResult<Self> {
        config.validate()?;

        tracing::info!(
            backend = %pool.backend_type(),
            max_connections = config.max_connections,
            idle_timeout_ms = config.idle_timeout.map(|t| t.as_millis() as u64),
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "Connection pool ready"
        );

        Ok(Self {
            pool,
            config,
            leased: Arc::new(AtomicU32::new(0)),
            acquire_count: AtomicU64::new(0),
            acquire_errors: AtomicU64::new(0),
            created_at: Instant::now(),
        })
    }

    /// Lazy PostgreSQL pool for `config`. Must be called from within a tokio
    /// runtime; the first `acquire` connects.
    pub fn postgres(config: &DatabaseConfig) -> OrmResult<Self> {
        let pool = PostgresPool::from_config(config)?;
        Self::new(Arc::new(pool), PoolConfig::from(config))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Lease a connection, waiting at most `acquire_timeout`
    pub async fn acquire(&self) -> OrmResult<PooledConnection> {
        self.acquire_count.fetch_add(1, Ordering::Relaxed);

        let result = match self.pool.acquire().await {
            Ok(conn) => Ok(PooledConnection::new(
                conn,
                Arc::clone(&self.leased),
                self.config.log_query_params,
            )),
            Err(e) if e.kind() == ErrorKind::PoolExhausted => {
                Err(ClassifiedError::pool_exhausted(self.config.acquire_timeout))
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => {
                tracing::debug!(
                    "Database connection acquired (leased: {}, idle: {})",
                    self.leased.load(Ordering::SeqCst),
                    self.pool.num_idle()
                );
            }
            Err(e) => {
                self.acquire_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(kind = %e.kind(), "Failed to acquire database connection: {}", e);
            }
        }

        result
    }

    /// Return a lease to the pool. Dropping the lease does the same.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Run `f` with an exclusive lease, releasing it however `f` finishes
    pub async fn run_exclusive<F, R>(&self, f: F) -> OrmResult<R>
    where
        F: for<'c> FnOnce(&'c mut PooledConnection) -> BoxFuture<'c, OrmResult<R>>,
    {
        let mut conn = self.acquire().await?;
        let result = f(&mut conn).await;
        self.release(conn);
        result
    }

    /// Begin a transaction on a fresh lease
    pub async fn begin(&self) -> OrmResult<Transaction> {
        self.begin_with(TransactionConfig::default()).await
    }

    pub async fn begin_with(&self, config: TransactionConfig) -> OrmResult<Transaction> {
        let conn = self.acquire().await?;
        Transaction::begin(conn, config).await
    }

    /// Execute a single statement on a short lease
    pub async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        let mut conn = self.acquire().await?;
        conn.execute(sql, params).await
    }

    /// Fetch rows on a short lease
    pub async fn fetch_all(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<DatabaseRow>> {
        let mut conn = self.acquire().await?;
        conn.fetch_all(sql, params).await
    }

    /// Whether the database answers right now. Never fails.
    pub async fn test_connection(&self) -> bool {
        match self.health_check().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Database connection test failed: {}", e);
                false
            }
        }
    }

    /// Round-trip a trivial query and report how long it took
    pub async fn health_check(&self) -> OrmResult<Duration> {
        let start = Instant::now();
        let mut conn = self.acquire().await?;
        conn.ping().await?;
        let elapsed = start.elapsed();
        tracing::debug!("Database health check passed in {:?}", elapsed);
        Ok(elapsed)
    }

    /// Health check plus pool usage figures. An unreachable database is
    /// reported, not returned as an error.
    pub async fn detailed_health_check(&self) -> PoolHealthReport {
        match self.health_check().await {
            Ok(elapsed) => PoolHealthReport::connected(elapsed, self.stats()),
            Err(e) => {
                tracing::warn!("Database health check failed: {}", e);
                PoolHealthReport::disconnected(e.to_string(), self.stats())
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_connections: self.config.max_connections,
            size: self.pool.size(),
            active_connections: self.leased.load(Ordering::SeqCst),
            idle_connections: self.pool.num_idle(),
            acquire_count: self.acquire_count.load(Ordering::Relaxed),
            acquire_errors: self.acquire_errors.load(Ordering::Relaxed),
            created_at: self.created_at,
        }
    }

    /// Close the pool. Idle connections are closed now, leased ones when
    /// they are released. Later `acquire` calls fail with `PoolClosed`.
    pub async fn close_all(&self) {
        if self.pool.is_closed() {
            return;
        }

        let idle = self.pool.num_idle();
        let leased = self.leased.load(Ordering::SeqCst);
        self.pool.close().await;

        tracing::info!(
            closed_idle = idle,
            still_leased = leased,
            "Connection pool closed"
        );
    }
}

/// An exclusive lease on a pooled connection
pub struct PooledConnection {
    conn: Option<Box<dyn DatabaseConnection>>,
    leased: Arc<AtomicU32>,
    log_params: bool,
    in_transaction: bool,
}

impl PooledConnection {
    fn new(conn: Box<dyn DatabaseConnection>, leased: Arc<AtomicU32>, log_params: bool) -> Self {
        leased.fetch_add(1, Ordering::SeqCst);
        Self {
            conn: Some(conn),
            leased,
            log_params,
            in_transaction: false,
        }
    }

    fn connection(&mut self) -> OrmResult<&mut Box<dyn DatabaseConnection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| ClassifiedError::unexpected("Connection has already been released"))
    }

    /// Execute statements, logging text, parameter count, duration and rows
    pub async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        let log_params = self.log_params;
        let start = Instant::now();
        let result = self.connection()?.execute(sql, params).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(rows) => log_statement(sql, params, log_params, elapsed, *rows),
            Err(e) => log_failure(sql, params, log_params, elapsed, e),
        }
        result
    }

    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<DatabaseRow>> {
        let log_params = self.log_params;
        let start = Instant::now();
        let result = self.connection()?.fetch_all(sql, params).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(rows) => log_statement(sql, params, log_params, elapsed, rows.len() as u64),
            Err(e) => log_failure(sql, params, log_params, elapsed, e),
        }
        result
    }

    pub async fn ping(&mut self) -> OrmResult<()> {
        self.connection()?.ping().await
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("in_transaction", &self.in_transaction)
            .field("released", &self.conn.is_none())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.leased.fetch_sub(1, Ordering::SeqCst);
        let Some(conn) = self.conn.take() else {
            return;
        };

        if self.in_transaction {
            tracing::warn!("Connection released with an open transaction; discarding it");
            conn.discard();
        }
        // Otherwise the backend takes the connection back when it drops here.
    }
}

fn render_params(params: &[DatabaseValue], log_params: bool) -> String {
    if log_params {
        format!("{:?}", params)
    } else {
        "[redacted]".to_string()
    }
}

fn log_statement(
    sql: &str,
    params: &[DatabaseValue],
    log_params: bool,
    elapsed: Duration,
    rows: u64,
) {
    tracing::debug!(
        sql = %sql,
        param_count = params.len(),
        params = %render_params(params, log_params),
        duration_ms = elapsed.as_secs_f64() * 1000.0,
        rows = rows,
        "Executed statement"
    );
}

fn log_failure(
    sql: &str,
    params: &[DatabaseValue],
    log_params: bool,
    elapsed: Duration,
    err: &ClassifiedError,
) {
    tracing::error!(
        sql = %sql,
        param_count = params.len(),
        params = %render_params(params, log_params),
        duration_ms = elapsed.as_secs_f64() * 1000.0,
        code = err.source_code().unwrap_or("-"),
        "Statement failed: {}",
        err
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryDatabase;
    use futures::FutureExt;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn config(max_connections: u32) -> PoolConfig {
        PoolConfig {
            max_connections,
            idle_timeout: None,
            acquire_timeout: Duration::from_millis(100),
            log_query_params: false,
        }
    }

    fn pool(db: &MemoryDatabase, config: PoolConfig) -> ManagedPool {
        db.managed_pool(config).unwrap()
    }

    async fn backend_pid(conn: &mut PooledConnection) -> i32 {
        let rows = conn.fetch_all("SELECT pg_backend_pid()", &[]).await.unwrap();
        match rows[0].get_by_name("pg_backend_pid").unwrap() {
            DatabaseValue::Int32(pid) => *pid,
            other => panic!("unexpected pid value {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, config(2));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn);
        let conn = pool.acquire().await.unwrap();
        drop(conn);

        assert_eq!(db.connections_opened(), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.acquire_count, 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, config(1));

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        assert_eq!(err.status_class().http_status(), 503);
        assert!(err.detail().unwrap().contains("100ms"));
        assert_eq!(pool.stats().acquire_errors, 1);

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_blocked_acquire_succeeds_when_lease_is_released() {
        let db = MemoryDatabase::new();
        let pool = Arc::new(pool(
            &db,
            PoolConfig {
                acquire_timeout: Duration::from_secs(2),
                ..config(1)
            },
        ));

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(drop) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(db.connections_opened(), 1);
        assert_eq!(pool.stats().acquire_errors, 0);
    }

    #[tokio::test]
    async fn test_blocked_acquire_fails_when_pool_closes() {
        let db = MemoryDatabase::new();
        let pool = Arc::new(pool(
            &db,
            PoolConfig {
                acquire_timeout: Duration::from_secs(2),
                ..config(1)
            },
        ));

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(drop) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.close_all().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolClosed);
        drop(held);
        assert_eq!(db.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_leases_use_distinct_connections() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, config(2));

        let mut first = pool.acquire().await.unwrap();
        let mut second = pool.acquire().await.unwrap();
        let first_pid = backend_pid(&mut first).await;
        let second_pid = backend_pid(&mut second).await;
        assert_ne!(first_pid, second_pid);

        // An aborted transaction on one lease leaves the other usable.
        first.execute("BEGIN", &[]).await.unwrap();
        assert!(first.execute("FAIL 23505", &[]).await.is_err());
        assert!(second.execute("SELECT 1", &[]).await.is_ok());
        first.execute("ROLLBACK", &[]).await.unwrap();

        drop(first);
        drop(second);
        let mut again = pool.acquire().await.unwrap();
        assert!([first_pid, second_pid].contains(&backend_pid(&mut again).await));
    }

    #[tokio::test]
    async fn test_no_connection_is_leased_twice_under_contention() {
        let db = MemoryDatabase::new();
        let pool = Arc::new(pool(
            &db,
            PoolConfig {
                acquire_timeout: Duration::from_secs(5),
                ..config(3)
            },
        ));
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let in_use = Arc::clone(&in_use);
                tokio::spawn(async move {
                    let mut conn = pool.acquire().await.unwrap();
                    let pid = backend_pid(&mut conn).await;
                    assert!(in_use.lock().unwrap().insert(pid), "pid {} leased twice", pid);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_use.lock().unwrap().remove(&pid);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert!(db.connections_opened() <= 3);
        assert_eq!(pool.stats().active_connections, 0);
        assert_eq!(pool.stats().acquire_errors, 0);
    }

    #[tokio::test]
    async fn test_slow_connect_counts_against_acquire_timeout() {
        let db = MemoryDatabase::new();
        db.set_connect_delay(Some(Duration::from_millis(500)));
        let pool = pool(&db, config(1));

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_on_error() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, config(1));

        let result: OrmResult<()> = pool
            .run_exclusive(|conn| {
                async move {
                    conn.execute("FAIL 23514", &[]).await?;
                    Ok(())
                }
                .boxed()
            })
            .await;
        assert!(result.is_err());

        let value = pool
            .run_exclusive(|conn| {
                async move {
                    let rows = conn.fetch_all("SELECT 1", &[]).await?;
                    Ok(rows.len())
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_close_all_rejects_new_leases() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, config(2));

        let leased = pool.acquire().await.unwrap();
        drop(pool.acquire().await.unwrap());
        pool.close_all().await;

        assert!(pool.is_closed());
        assert_eq!(pool.stats().idle_connections, 0);
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolClosed);

        drop(leased);
        assert_eq!(db.connections_closed(), 2);
        assert_eq!(pool.stats().idle_connections, 0);
    }

    #[tokio::test]
    async fn test_idle_connections_expire() {
        let db = MemoryDatabase::new();
        let pool = pool(
            &db,
            PoolConfig {
                idle_timeout: Some(Duration::from_millis(20)),
                ..config(2)
            },
        );

        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.stats().idle_connections, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.stats().idle_connections, 0);
        assert_eq!(db.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_lease_dropped_mid_transaction_is_discarded() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, config(1));

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.execute("BEGIN", &[]).await.unwrap();
            conn.set_in_transaction(true);
            conn.execute("CREATE TABLE partial (id INT)", &[]).await.unwrap();
        }

        assert_eq!(pool.stats().idle_connections, 0);
        assert!(!db.has_table("partial"));
        assert!(pool.acquire().await.is_ok());
        assert_eq!(db.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_test_connection_reports_dead_database() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, config(1));
        assert!(pool.test_connection().await);

        db.set_offline(true);
        assert!(!pool.test_connection().await);
    }

    #[tokio::test]
    async fn test_detailed_health_check() {
        let db = MemoryDatabase::new();
        let pool = pool(&db, config(4));

        let report = pool.detailed_health_check().await;
        assert!(report.is_healthy());
        assert!(report.response_time.is_some());
        assert_eq!(report.pool.max_connections, 4);
        assert_eq!(report.pool.size, 1);
        assert_eq!(report.pool.acquire_errors, 0);

        db.set_offline(true);
        let report = pool.detailed_health_check().await;
        assert_eq!(report.database, crate::connection::DatabaseStatus::Disconnected);
        assert!(report.error.is_some());
        assert!(!report.is_healthy());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let db = MemoryDatabase::new();
        let err = db.managed_pool(config(0)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Misconfiguration);
    }
}
