//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the migration file format, ledger records and the result types
//! returned by the runner.

use crate::backends::DatabaseRow;
use crate::error::{ClassifiedError, OrmResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use strata_core::MigrationSettings;

/// Start of the line separating the apply section from the rollback section
pub const ROLLBACK_MARKER: &str = "-- ROLLBACK";

/// Configuration for the migration system
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory where migration files are stored
    pub migrations_dir: PathBuf,
    /// Table name for tracking migrations
    pub migrations_table: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            migrations_table: "migrations".to_string(),
        }
    }
}

impl From<&MigrationSettings> for MigrationConfig {
    fn from(settings: &MigrationSettings) -> Self {
        Self {
            migrations_dir: settings.directory.clone(),
            migrations_table: settings.table.clone(),
        }
    }
}

impl MigrationConfig {
    /// The table name is interpolated into SQL, so it must be a plain identifier
    pub fn validate(&self) -> OrmResult<()> {
        strata_core::config::validate_identifier("migrations_table", &self.migrations_table)
            .map_err(|e| {
                ClassifiedError::new(
                    crate::error::ErrorKind::Misconfiguration,
                    "Invalid migrations table name",
                )
                .with_detail(e.to_string())
            })
    }
}

/// A parsed migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub filename: String,
    /// SQL run by `up`; never empty
    pub apply: String,
    /// SQL run by `down`; `None` when the file cannot be reversed
    pub rollback: Option<String>,
}

impl MigrationFile {
    /// Parse file content into its sections.
    ///
    /// The apply section is everything before the first line that starts
    /// with `-- ROLLBACK` once leading whitespace is stripped, so the marker
    /// may carry a note such as `-- ROLLBACK: drop the table`. The rollback
    /// section is everything after that line. Both are trimmed, and a blank
    /// rollback section counts as absent.
    pub fn parse(filename: impl Into<String>, content: &str) -> OrmResult<Self> {
        let filename = filename.into();
        let (apply, rollback) = split_sections(content);

        if apply.is_empty() {
            return Err(ClassifiedError::invalid_migration(format!(
                "Migration {} has an empty apply section",
                filename
            )));
        }

        Ok(Self {
            filename,
            apply,
            rollback,
        })
    }

    pub fn is_reversible(&self) -> bool {
        self.rollback.is_some()
    }
}

fn split_sections(content: &str) -> (String, Option<String>) {
    let mut apply = Vec::new();
    let mut lines = content.lines();

    for line in lines.by_ref() {
        if line.trim_start().starts_with(ROLLBACK_MARKER) {
            let rollback = lines.collect::<Vec<_>>().join("\n").trim().to_string();
            let rollback = (!rollback.is_empty()).then_some(rollback);
            return (apply.join("\n").trim().to_string(), rollback);
        }
        apply.push(line);
    }

    (apply.join("\n").trim().to_string(), None)
}

/// A ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub filename: String,
    pub executed_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn from_row(row: &DatabaseRow) -> OrmResult<Self> {
        Ok(Self {
            filename: row.get_string("filename")?,
            executed_at: row.get_datetime("executed_at")?,
        })
    }
}

/// Result of running migrations
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRunResult {
    /// Number of migrations that were applied
    pub applied_count: usize,
    /// Filenames applied by this run, in order
    pub applied_migrations: Vec<String>,
    /// Number of migrations that were skipped (already applied)
    pub skipped_count: usize,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

/// Result of reversing the most recent migration
#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub rolled_back: String,
    pub execution_time_ms: u128,
}

/// Applied and pending migrations at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusReport {
    /// Ledger rows in application order
    pub applied: Vec<MigrationRecord>,
    /// Files not yet applied, in apply order
    pub pending: Vec<String>,
}

impl MigrationStatusReport {
    pub fn total(&self) -> usize {
        self.applied.len() + self.pending.len()
    }

    /// "Total: N migrations (X executed, Y pending)"
    pub fn summary(&self) -> String {
        format!(
            "Total: {} migrations ({} executed, {} pending)",
            self.total(),
            self.applied.len(),
            self.pending.len()
        )
    }
}
