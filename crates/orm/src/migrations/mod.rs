//! Migration System
//!
//! Timestamped SQL files, a ledger table recording which ones ran, and a
//! runner that applies or reverses them transactionally.

pub mod definitions;
pub mod ledger;
pub mod manager;
pub mod rollback;
pub mod runner;

pub use definitions::*;
pub use ledger::MigrationLedger;
pub use manager::{slugify, MigrationManager};
pub use runner::{pending_migrations, MigrationRunner};
