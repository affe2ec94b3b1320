//! Database Backend Abstractions
//!
//! [`crate::connection::ManagedPool`] talks to drivers only through
//! [`DatabasePool`] and [`DatabaseConnection`]. PostgreSQL is the production
//! backend; the in-memory backend exists for tests.

pub mod core;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod postgres;

// Re-export core traits and types
pub use self::core::*;
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryConnection, MemoryDatabase, MemoryPool};
pub use postgres::{PostgresConnection, PostgresPool};

/// Database backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    PostgreSQL,
    Memory,
}

impl std::fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseBackendType::PostgreSQL => write!(f, "postgresql"),
            DatabaseBackendType::Memory => write!(f, "memory"),
        }
    }
}
