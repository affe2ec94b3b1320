//! PostgreSQL Backend Implementation
//!
//! Pooling is delegated to sqlx's `PgPool`; [`crate::connection::ManagedPool`]
//! wraps it with lease accounting and statement logging.

use super::core::*;
use super::DatabaseBackendType;
use crate::connection::PoolConfig;
use crate::error::{ClassifiedError, ErrorKind, OrmResult};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection, Executor, Postgres, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use strata_core::{DatabaseConfig, TlsMode};

/// PostgreSQL connection pool over sqlx
#[derive(Debug, Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Build a pool for `database_url`. No connection is opened until the
    /// first acquire, so this must run inside a tokio runtime but never
    /// touches the network.
    pub fn connect_lazy(
        database_url: &str,
        tls_mode: TlsMode,
        config: &PoolConfig,
    ) -> OrmResult<Self> {
        config.validate()?;
        let options = connect_options(database_url, tls_mode)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(0)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .test_before_acquire(true)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    pub fn from_config(config: &DatabaseConfig) -> OrmResult<Self> {
        let url = config.require_url().map_err(|e| {
            ClassifiedError::new(ErrorKind::Misconfiguration, "Database URL is not configured")
                .with_detail(e.to_string())
        })?;
        Self::connect_lazy(url, config.tls_mode, &PoolConfig::from(config))
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn acquire(&self) -> OrmResult<Box<dyn DatabaseConnection>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PostgresConnection::new(conn)))
    }

    async fn close(&self) {
        // Resolves once every leased connection has been returned.
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn size(&self) -> u32 {
        self.pool.size()
    }

    fn num_idle(&self) -> u32 {
        self.pool.num_idle() as u32
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }
}

fn connect_options(database_url: &str, tls_mode: TlsMode) -> OrmResult<PgConnectOptions> {
    validate_database_url(database_url)?;

    let ssl_mode = match tls_mode {
        TlsMode::Disable => PgSslMode::Disable,
        TlsMode::Prefer => PgSslMode::Prefer,
        TlsMode::Require => PgSslMode::Require,
    };

    Ok(PgConnectOptions::from_str(database_url)
        .map_err(ClassifiedError::from)?
        .ssl_mode(ssl_mode)
        // Statements are logged by the pool, with parameters redacted.
        .disable_statement_logging())
}

fn validate_database_url(url: &str) -> OrmResult<()> {
    let misconfigured = |reason: String| {
        ClassifiedError::new(ErrorKind::Misconfiguration, "Invalid database URL")
            .with_detail(reason)
    };

    let parsed = url::Url::parse(url).map_err(|e| misconfigured(e.to_string()))?;
    if parsed.scheme() != "postgres" && parsed.scheme() != "postgresql" {
        return Err(misconfigured(format!(
            "unsupported scheme '{}', expected postgres",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(misconfigured("missing host".to_string()));
    }
    Ok(())
}

/// A connection leased from a [`PostgresPool`]
pub struct PostgresConnection {
    conn: PoolConnection<Postgres>,
}

impl PostgresConnection {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        if params.is_empty() {
            // Unprepared text goes over the simple query protocol, which
            // accepts multi-statement migration sections.
            let result = Executor::execute(&mut *self.conn, sql).await?;
            return Ok(result.rows_affected());
        }

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let result = query.execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<DatabaseRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let rows = query.fetch_all(&mut *self.conn).await?;
        rows.iter().map(postgres_row_to_database_row).collect()
    }

    async fn ping(&mut self) -> OrmResult<()> {
        self.conn.ping().await?;
        Ok(())
    }

    fn discard(self: Box<Self>) {
        // Detached connections do not count against the pool; dropping the
        // socket makes the server abort any open transaction.
        drop(self.conn.detach());
    }
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'a>(
    query: Query<'a, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> Query<'a, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
    }
}

fn postgres_row_to_database_row(row: &PgRow) -> OrmResult<DatabaseRow> {
    let columns: Vec<String> = row
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();

    let values = (0..columns.len())
        .map(|index| postgres_value_to_database_value(row, index))
        .collect::<OrmResult<Vec<_>>>()?;

    Ok(DatabaseRow::new(columns, values))
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> OrmResult<DatabaseValue> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name();

    let value = match type_name {
        "INT2" => DatabaseValue::Int32(i32::from(row.try_get::<i16, _>(index)?)),
        "INT4" => DatabaseValue::Int32(row.try_get(index)?),
        "INT8" => DatabaseValue::Int64(row.try_get(index)?),
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index)?),
        "TIMESTAMP" => {
            let naive: chrono::NaiveDateTime = row.try_get(index)?;
            DatabaseValue::DateTime(naive.and_utc())
        }
        _ => {
            let value: String = row.try_get(index).map_err(|e| {
                ClassifiedError::unexpected(format!(
                    "Unsupported column type '{}' at index {}",
                    type_name, index
                ))
                .with_detail(e.to_string())
            })?;
            DatabaseValue::String(value)
        }
    };

    Ok(value)
}
