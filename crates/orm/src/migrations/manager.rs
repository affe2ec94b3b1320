//! Migration Manager - File system operations for migrations
//!
//! Handles discovering, loading and creating migration files.

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::PathBuf;

use super::definitions::{MigrationConfig, MigrationFile, ROLLBACK_MARKER};
use crate::error::{classify, ClassifiedError, OrmResult};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const TIMESTAMP_LEN: usize = 14;

/// Migration manager for creating and loading migrations
#[derive(Debug, Clone)]
pub struct MigrationManager {
    config: MigrationConfig,
}

impl MigrationManager {
    /// Create a new migration manager with default configuration
    pub fn new() -> Self {
        Self::with_config(MigrationConfig::default())
    }

    /// Create a new migration manager with custom configuration
    pub fn with_config(config: MigrationConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    fn ensure_directory(&self) -> OrmResult<()> {
        fs::create_dir_all(&self.config.migrations_dir).map_err(|e| {
            classify(e).with_context(format!(
                "Failed to create migrations directory {}",
                self.config.migrations_dir.display()
            ))
        })
    }

    /// Filenames of all `.sql` files in the directory, sorted.
    ///
    /// A missing directory is created and yields an empty list.
    pub fn discover(&self) -> OrmResult<Vec<String>> {
        self.ensure_directory()?;

        let read_error = |e: std::io::Error| {
            classify(e).with_context(format!(
                "Failed to read migrations directory {}",
                self.config.migrations_dir.display()
            ))
        };

        let mut filenames = Vec::new();
        for entry in fs::read_dir(&self.config.migrations_dir).map_err(read_error)? {
            let entry = entry.map_err(read_error)?;
            let path = entry.path();

            if !path.is_file() || path.extension().map_or(true, |ext| ext != "sql") {
                continue;
            }

            let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
                tracing::warn!("Skipping migration with non UTF-8 filename: {}", path.display());
                continue;
            };

            if !has_timestamp_prefix(filename) {
                tracing::warn!(
                    "Migration {} does not start with a 14-digit timestamp; ordering may be unexpected",
                    filename
                );
            }
            filenames.push(filename.to_string());
        }

        filenames.sort();
        Ok(filenames)
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.config.migrations_dir.join(filename)
    }

    /// Read and parse one migration file
    pub fn load(&self, filename: &str) -> OrmResult<MigrationFile> {
        let path = self.path_for(filename);
        let content = fs::read_to_string(&path).map_err(|e| match e.kind() {
            IoErrorKind::NotFound => ClassifiedError::migration_file_missing(filename),
            _ => classify(e).with_context(format!("Failed to read migration {}", filename)),
        })?;

        MigrationFile::parse(filename, &content)
    }

    /// Create a new migration file from the template and return its filename.
    ///
    /// Never overwrites an existing file.
    pub fn create_migration(&self, name: &str) -> OrmResult<String> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(ClassifiedError::invalid_migration(format!(
                "Migration name '{}' has no usable characters",
                name
            )));
        }

        self.ensure_directory()?;

        let now = Utc::now();
        let filename = format!("{}_{}.sql", now.format(TIMESTAMP_FORMAT), slug);
        let path = self.path_for(&filename);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                IoErrorKind::AlreadyExists => ClassifiedError::invalid_migration(format!(
                    "Migration {} already exists",
                    filename
                )),
                _ => classify(e).with_context(format!("Failed to create {}", path.display())),
            })?;

        let created = now.format("%Y-%m-%d %H:%M:%S UTC").to_string();
        file.write_all(migration_template(name, &created).as_bytes())
            .map_err(|e| classify(e).with_context(format!("Failed to write {}", path.display())))?;

        tracing::info!("Created migration {}", filename);
        Ok(filename)
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn has_timestamp_prefix(filename: &str) -> bool {
    filename.len() > TIMESTAMP_LEN
        && filename.as_bytes()[..TIMESTAMP_LEN].iter().all(u8::is_ascii_digit)
}

/// Lowercase, with every run of non-alphanumeric characters collapsed to `_`
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }

    slug
}

fn migration_template(name: &str, created: &str) -> String {
    format!(
        "-- Migration: {name}\n\
         -- Created: {created}\n\
         \n\
         -- UP\n\
         -- Write the schema change here.\n\
         \n\
         {marker}\n\
         -- Write the statements that undo the change here.\n",
        name = name,
        created = created,
        marker = ROLLBACK_MARKER,
    )
}
