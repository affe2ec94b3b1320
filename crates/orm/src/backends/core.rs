//! Core Database Backend Traits
//!
//! A backend pool hands out connections; a connection executes statements.
//! Lease accounting, transactions and statement logging live above this
//! layer so every backend gets them for free.

use crate::backends::DatabaseBackendType;
use crate::error::{ClassifiedError, OrmResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Backend connection pool
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Lease a connection. Dropping it returns it to the pool.
    ///
    /// Fails with `PoolExhausted` once the backend's acquire timeout passes
    /// and with `PoolClosed` after [`DatabasePool::close`].
    async fn acquire(&self) -> OrmResult<Box<dyn DatabaseConnection>>;

    /// Stop handing out connections and close idle ones
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Open connections, leased or idle
    fn size(&self) -> u32;

    fn num_idle(&self) -> u32;

    /// Get the backend type
    fn backend_type(&self) -> DatabaseBackendType;
}

/// Abstract database connection trait
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Execute statements and return the affected row count.
    ///
    /// Without parameters the text may hold several `;`-separated statements.
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64>;

    /// Execute a query and return the result rows
    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> OrmResult<Vec<DatabaseRow>>;

    /// Round-trip to the server to check the connection is alive
    async fn ping(&mut self) -> OrmResult<()>;

    /// Drop the physical connection instead of returning it to its pool
    fn discard(self: Box<Self>);
}

/// A result row with its column names
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseRow {
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl DatabaseRow {
    pub fn new(columns: Vec<String>, values: Vec<DatabaseValue>) -> Self {
        Self { columns, values }
    }

    /// Get a column value by index
    pub fn get_by_index(&self, index: usize) -> OrmResult<&DatabaseValue> {
        self.values.get(index).ok_or_else(|| {
            ClassifiedError::unexpected(format!("Column index {} out of bounds", index))
        })
    }

    /// Get a column value by name
    pub fn get_by_name(&self, name: &str) -> OrmResult<&DatabaseValue> {
        let index = self
            .columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| ClassifiedError::unexpected(format!("Column '{}' not found", name)))?;
        self.get_by_index(index)
    }

    pub fn get_string(&self, name: &str) -> OrmResult<String> {
        match self.get_by_name(name)? {
            DatabaseValue::String(value) => Ok(value.clone()),
            other => Err(type_mismatch(name, "string", other)),
        }
    }

    pub fn get_datetime(&self, name: &str) -> OrmResult<DateTime<Utc>> {
        match self.get_by_name(name)? {
            DatabaseValue::DateTime(value) => Ok(*value),
            other => Err(type_mismatch(name, "timestamp", other)),
        }
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn type_mismatch(column: &str, expected: &str, found: &DatabaseValue) -> ClassifiedError {
    ClassifiedError::unexpected(format!(
        "Column '{}' is not a {} (found {})",
        column,
        expected,
        found.type_name()
    ))
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Int32(i32),
    Int64(i64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DatabaseValue::Null => "null",
            DatabaseValue::Int32(_) => "int4",
            DatabaseValue::Int64(_) => "int8",
            DatabaseValue::String(_) => "text",
            DatabaseValue::DateTime(_) => "timestamptz",
        }
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ledger_row() -> DatabaseRow {
        DatabaseRow::new(
            vec!["filename".to_string(), "executed_at".to_string()],
            vec![
                DatabaseValue::from("20240101000000_init.sql"),
                DatabaseValue::from(Utc::now()),
            ],
        )
    }

    #[test]
    fn test_typed_getters() {
        let row = ledger_row();
        assert_eq!(row.get_string("filename").unwrap(), "20240101000000_init.sql");
        assert!(row.get_datetime("executed_at").is_ok());
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_missing_column_and_type_mismatch() {
        let row = ledger_row();
        let err = row.get_string("id").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert!(err.message().contains("'id'"));

        let err = row.get_datetime("filename").unwrap_err();
        assert!(err.message().contains("timestamp"));
    }

    #[test]
    fn test_option_conversion() {
        assert!(DatabaseValue::from(None::<String>).is_null());
        assert_eq!(DatabaseValue::from(Some(7i64)), DatabaseValue::Int64(7));
    }

}
