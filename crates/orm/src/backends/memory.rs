//! In-memory backend for tests
//!
//! Understands the small SQL dialect the migration engine and its tests use:
//! table DDL, ledger inserts/deletes/selects, `BEGIN`/`COMMIT`/`ROLLBACK`,
//! `SET` (ignored), `SELECT 1`, `SELECT pg_backend_pid()` and `FAIL <sqlstate>`
//! to inject a storage error. Failures are raised as SQLSTATE storage errors
//! and go through the same classifier as driver errors.
//!
//! [`MemoryPool`] stands in for sqlx's pool: bounded, closable, and failing
//! with the same `PoolTimedOut`/`PoolClosed` errors.

use super::core::*;
use super::DatabaseBackendType;
use crate::connection::{ManagedPool, PoolConfig};
use crate::error::{classify, OrmResult, RawFailure};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<LedgerRow>,
    anonymous_rows: u64,
}

#[derive(Debug, Clone)]
struct LedgerRow {
    id: i64,
    filename: String,
    executed_at: DateTime<Utc>,
}

type Tables = BTreeMap<String, Table>;

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    next_id: i64,
    statements: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    offline: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    next_pid: AtomicU32,
}

/// Shared in-memory database; clones see the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pool handing out connections to this database
    pub fn pool(&self, config: &PoolConfig) -> Arc<dyn DatabasePool> {
        Arc::new(MemoryPool::new(self.clone(), config))
    }

    /// [`ManagedPool`] over [`MemoryDatabase::pool`]
    pub fn managed_pool(&self, config: PoolConfig) -> OrmResult<ManagedPool> {
        ManagedPool::new(self.pool(&config), config)
    }

    /// Open a connection outside any pool, honouring the connect delay
    pub async fn connect(&self) -> OrmResult<MemoryConnection> {
        let delay = *self
            .shared
            .connect_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.is_offline() {
            return Err(storage_error("08006", "connection refused"));
        }

        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            db: self.clone(),
            pid: self.shared.next_pid.fetch_add(1, Ordering::SeqCst) + 1,
            snapshot: None,
            aborted: false,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge every other assertion.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state().tables.contains_key(&name.to_lowercase())
    }

    /// Filenames recorded in `table`, in id order
    pub fn ledger_rows(&self, table: &str) -> Vec<String> {
        self.state()
            .tables
            .get(&table.to_lowercase())
            .map(|t| t.rows.iter().map(|row| row.filename.clone()).collect())
            .unwrap_or_default()
    }

    /// Insert ledger rows directly, creating the table if needed
    pub fn seed_ledger(&self, table: &str, filenames: &[&str]) {
        let mut state = self.state();
        let mut next_id = state.next_id;
        let entry = state.tables.entry(table.to_lowercase()).or_default();
        for filename in filenames {
            next_id += 1;
            entry.rows.push(LedgerRow {
                id: next_id,
                filename: filename.to_string(),
                executed_at: Utc::now(),
            });
        }
        state.next_id = next_id;
    }

    /// Every statement executed so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state().statements.clear();
    }

    /// Make new connections and statements on open connections fail with 08006
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every new connection by `delay`
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self
            .shared
            .connect_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    pub fn connections_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn is_offline(&self) -> bool {
        self.shared.offline.load(Ordering::SeqCst)
    }
}

struct IdleConnection {
    conn: MemoryConnection,
    since: Instant,
}

struct PoolInner {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    closed: AtomicBool,
    max_connections: u32,
    acquire_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<IdleConnection>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close idle connections older than `idle_timeout`
    fn reap(&self) {
        if let Some(timeout) = self.idle_timeout {
            self.idle().retain(|entry| entry.since.elapsed() < timeout);
        }
    }

    fn leased(&self) -> u32 {
        self.max_connections
            .saturating_sub(self.semaphore.available_permits() as u32)
    }
}

/// Pool over a [`MemoryDatabase`]
pub struct MemoryPool {
    db: MemoryDatabase,
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    pub fn new(db: MemoryDatabase, config: &PoolConfig) -> Self {
        Self {
            db,
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                max_connections: config.max_connections,
                acquire_timeout: config.acquire_timeout,
                idle_timeout: config.idle_timeout,
            }),
        }
    }

    async fn checkout(&self) -> OrmResult<Box<dyn DatabaseConnection>> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| classify(sqlx::Error::PoolClosed))?;

        self.inner.reap();
        let reused = self.inner.idle().pop().map(|entry| entry.conn);
        let conn = match reused {
            Some(conn) => conn,
            None => self.db.connect().await?,
        };

        Ok(Box::new(LeasedConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }))
    }
}

#[async_trait]
impl DatabasePool for MemoryPool {
    async fn acquire(&self) -> OrmResult<Box<dyn DatabaseConnection>> {
        if self.inner.is_closed() {
            return Err(classify(sqlx::Error::PoolClosed));
        }
        match tokio::time::timeout(self.inner.acquire_timeout, self.checkout()).await {
            Ok(result) => result,
            Err(_) => Err(classify(sqlx::Error::PoolTimedOut)),
        }
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore.close();
        self.inner.idle().clear();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn size(&self) -> u32 {
        self.inner.leased() + self.num_idle()
    }

    fn num_idle(&self) -> u32 {
        self.inner.reap();
        self.inner.idle().len() as u32
    }

    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::Memory
    }
}

/// A [`MemoryConnection`] leased from a [`MemoryPool`]
struct LeasedConnection {
    conn: Option<MemoryConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl LeasedConnection {
    fn conn(&mut self) -> OrmResult<&mut MemoryConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| crate::error::ClassifiedError::unexpected("Connection was discarded"))
    }
}

#[async_trait]
impl DatabaseConnection for LeasedConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        self.conn()?.execute(sql, params).await
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<DatabaseRow>> {
        self.conn()?.fetch_all(sql, params).await
    }

    async fn ping(&mut self) -> OrmResult<()> {
        self.conn()?.ping().await
    }

    fn discard(mut self: Box<Self>) {
        drop(self.conn.take());
    }
}

impl Drop for LeasedConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.pool.is_closed() {
            drop(conn);
        } else {
            self.pool.idle().push(IdleConnection {
                conn,
                since: Instant::now(),
            });
        }
        // The permit goes back after the connection is idle again.
    }
}

fn storage_error(code: &str, message: impl Into<String>) -> crate::error::ClassifiedError {
    classify(RawFailure::storage(code, message))
}

/// One connection to a [`MemoryDatabase`]
pub struct MemoryConnection {
    db: MemoryDatabase,
    /// Backend process id, unique per database
    pid: u32,
    /// Table state at `BEGIN`; `Some` while a transaction is open
    snapshot: Option<Tables>,
    /// Set when a statement fails inside a transaction
    aborted: bool,
}

enum Outcome {
    Affected(u64),
    Rows(Vec<DatabaseRow>),
}

impl MemoryConnection {
    fn run(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<Outcome>> {
        if self.db.is_offline() {
            return Err(storage_error("08006", "connection to server was lost"));
        }

        let statements = split_statements(sql);
        let implicit = self.snapshot.is_none();
        let before = if implicit {
            Some(self.db.state().tables.clone())
        } else {
            None
        };

        let mut outcomes = Vec::with_capacity(statements.len());
        for statement in statements {
            match self.run_statement(&statement, params) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    // A failed implicit transaction leaves no trace.
                    if let Some(before) = before {
                        self.db.state().tables = before;
                    }
                    if self.snapshot.is_some() {
                        self.aborted = true;
                    }
                    return Err(err);
                }
            }
        }
        Ok(outcomes)
    }

    fn run_statement(&mut self, statement: &str, params: &[DatabaseValue]) -> OrmResult<Outcome> {
        self.db.state().statements.push(statement.to_string());

        let upper = statement.to_ascii_uppercase();
        let words: Vec<&str> = upper.split_whitespace().collect();

        match words.as_slice() {
            ["BEGIN", ..] | ["START", "TRANSACTION", ..] => {
                if self.snapshot.is_none() {
                    self.snapshot = Some(self.db.state().tables.clone());
                    self.aborted = false;
                }
                return Ok(Outcome::Affected(0));
            }
            ["COMMIT", ..] | ["END", ..] => {
                if let Some(snapshot) = self.snapshot.take() {
                    if self.aborted {
                        self.db.state().tables = snapshot;
                    }
                }
                self.aborted = false;
                return Ok(Outcome::Affected(0));
            }
            ["ROLLBACK", ..] => {
                if let Some(snapshot) = self.snapshot.take() {
                    self.db.state().tables = snapshot;
                }
                self.aborted = false;
                return Ok(Outcome::Affected(0));
            }
            _ => {}
        }

        if self.aborted {
            return Err(storage_error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        let mut state = self.db.state();
        match words.as_slice() {
            ["FAIL", code, ..] => Err(storage_error(code, format!("injected failure {}", code))),
            ["SET", ..] => Ok(Outcome::Affected(0)),
            ["SELECT", "1"] => Ok(Outcome::Rows(vec![DatabaseRow::new(
                vec!["?column?".to_string()],
                vec![DatabaseValue::Int32(1)],
            )])),
            ["SELECT", "PG_BACKEND_PID()"] => Ok(Outcome::Rows(vec![DatabaseRow::new(
                vec!["pg_backend_pid".to_string()],
                vec![DatabaseValue::Int32(self.pid as i32)],
            )])),
            ["SELECT", "NOW()"] => Ok(Outcome::Rows(vec![DatabaseRow::new(
                vec!["now".to_string()],
                vec![DatabaseValue::DateTime(Utc::now())],
            )])),
            ["CREATE", "TABLE", "IF", "NOT", "EXISTS", ..] => {
                let name = table_name(statement, 5)?;
                state.tables.entry(name).or_default();
                Ok(Outcome::Affected(0))
            }
            ["CREATE", "TABLE", ..] => {
                let name = table_name(statement, 2)?;
                if state.tables.contains_key(&name) {
                    return Err(storage_error(
                        "42P07",
                        format!("relation \"{}\" already exists", name),
                    ));
                }
                state.tables.insert(name, Table::default());
                Ok(Outcome::Affected(0))
            }
            ["DROP", "TABLE", "IF", "EXISTS", ..] => {
                let name = table_name(statement, 4)?;
                state.tables.remove(&name);
                Ok(Outcome::Affected(0))
            }
            ["DROP", "TABLE", ..] => {
                let name = table_name(statement, 2)?;
                state
                    .tables
                    .remove(&name)
                    .map(|_| Outcome::Affected(0))
                    .ok_or_else(|| missing_relation(&name))
            }
            ["ALTER", "TABLE", ..] => {
                let name = table_name(statement, 2)?;
                if state.tables.contains_key(&name) {
                    Ok(Outcome::Affected(0))
                } else {
                    Err(missing_relation(&name))
                }
            }
            ["INSERT", "INTO", ..] => {
                let name = table_name(statement, 2)?;
                let next_id = state.next_id + 1;
                let table = state
                    .tables
                    .get_mut(&name)
                    .ok_or_else(|| missing_relation(&name))?;

                match params.first() {
                    Some(DatabaseValue::String(filename)) => {
                        if table.rows.iter().any(|row| &row.filename == filename) {
                            return Err(classify(RawFailure::Storage {
                                code: "23505".to_string(),
                                message: format!(
                                    "duplicate key value violates unique constraint \"{}_filename_key\"",
                                    name
                                ),
                                detail: Some(format!(
                                    "Key (filename)=({}) already exists.",
                                    filename
                                )),
                                constraint: Some(format!("{}_filename_key", name)),
                            }));
                        }
                        table.rows.push(LedgerRow {
                            id: next_id,
                            filename: filename.clone(),
                            executed_at: Utc::now(),
                        });
                        state.next_id = next_id;
                    }
                    _ => table.anonymous_rows += 1,
                }
                Ok(Outcome::Affected(1))
            }
            ["DELETE", "FROM", ..] => {
                let name = table_name(statement, 2)?;
                let table = state
                    .tables
                    .get_mut(&name)
                    .ok_or_else(|| missing_relation(&name))?;

                let before = table.rows.len();
                match params.first() {
                    Some(DatabaseValue::String(filename)) => {
                        table.rows.retain(|row| &row.filename != filename)
                    }
                    _ => table.rows.clear(),
                }
                Ok(Outcome::Affected((before - table.rows.len()) as u64))
            }
            ["SELECT", ..] => select_ledger(&state, statement, &upper),
            _ => Err(storage_error(
                "42601",
                format!("syntax error at or near \"{}\"", words.first().unwrap_or(&"")),
            )),
        }
    }
}

fn missing_relation(name: &str) -> crate::error::ClassifiedError {
    storage_error("42P01", format!("relation \"{}\" does not exist", name))
}

/// The identifier at word position `position`, without any column list
fn table_name(statement: &str, position: usize) -> OrmResult<String> {
    statement
        .split_whitespace()
        .nth(position)
        .map(|word| word.split('(').next().unwrap_or(word))
        .filter(|name| !name.is_empty())
        .map(|name| name.trim_matches('"').to_lowercase())
        .ok_or_else(|| storage_error("42601", format!("missing table name in: {}", statement)))
}

/// `SELECT <columns> FROM <table> ORDER BY id [ASC|DESC] [LIMIT n]`
fn select_ledger(state: &State, statement: &str, upper: &str) -> OrmResult<Outcome> {
    let from = upper
        .find(" FROM ")
        .ok_or_else(|| storage_error("42601", format!("unsupported query: {}", statement)))?;

    let columns: Vec<String> = statement["SELECT".len()..from]
        .split(',')
        .map(|column| column.trim().to_lowercase())
        .collect();

    let name = statement[from + " FROM ".len()..]
        .split_whitespace()
        .next()
        .map(|name| name.to_lowercase())
        .unwrap_or_default();
    let table = state
        .tables
        .get(&name)
        .ok_or_else(|| missing_relation(&name))?;

    let mut rows: Vec<&LedgerRow> = table.rows.iter().collect();
    rows.sort_by_key(|row| row.id);
    if upper.contains(" DESC") {
        rows.reverse();
    }

    let words: Vec<&str> = upper.split_whitespace().collect();
    if let Some(position) = words.iter().position(|word| *word == "LIMIT") {
        let limit = words
            .get(position + 1)
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| storage_error("42601", "invalid LIMIT"))?;
        rows.truncate(limit);
    }

    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        let values = columns
            .iter()
            .map(|column| match column.as_str() {
                "id" => Ok(DatabaseValue::Int64(row.id)),
                "filename" => Ok(DatabaseValue::String(row.filename.clone())),
                "executed_at" => Ok(DatabaseValue::DateTime(row.executed_at)),
                other => Err(storage_error(
                    "42703",
                    format!("column \"{}\" does not exist", other),
                )),
            })
            .collect::<OrmResult<Vec<_>>>()?;
        result.push(DatabaseRow::new(columns.clone(), values));
    }
    Ok(Outcome::Rows(result))
}

/// Split on `;`, dropping `--` comment lines and empty statements
fn split_statements(sql: &str) -> Vec<String> {
    let without_comments: String = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    without_comments
        .split(';')
        .map(|statement| statement.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|statement| !statement.is_empty())
        .collect()
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        let outcomes = self.run(sql, params)?;
        Ok(outcomes
            .iter()
            .map(|outcome| match outcome {
                Outcome::Affected(n) => *n,
                Outcome::Rows(rows) => rows.len() as u64,
            })
            .sum())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<DatabaseRow>> {
        let outcomes = self.run(sql, params)?;
        Ok(outcomes
            .into_iter()
            .rev()
            .find_map(|outcome| match outcome {
                Outcome::Rows(rows) => Some(rows),
                Outcome::Affected(_) => None,
            })
            .unwrap_or_default())
    }

    async fn ping(&mut self) -> OrmResult<()> {
        self.run("SELECT 1", &[]).map(|_| ())
    }

    fn discard(self: Box<Self>) {}
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // The server aborts an open transaction when its connection goes away.
        if let Some(snapshot) = self.snapshot.take() {
            self.db.state().tables = snapshot;
        }
        self.db.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}
