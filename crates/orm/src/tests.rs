//! Runner behaviour against the in-memory backend

use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use crate::backends::MemoryDatabase;
use crate::connection::PoolConfig;
use crate::error::{ConstraintKind, ErrorKind};
use crate::migrations::{MigrationConfig, MigrationRunner};

struct Fixture {
    db: MemoryDatabase,
    dir: TempDir,
    runner: MigrationRunner,
}

impl Fixture {
    async fn new() -> Self {
        let db = MemoryDatabase::new();
        let dir = TempDir::new().unwrap();
        let pool = db.managed_pool(PoolConfig::default()).unwrap();
        let config = MigrationConfig {
            migrations_dir: dir.path().to_path_buf(),
            migrations_table: "migrations".to_string(),
        };
        let runner = MigrationRunner::new(config, Arc::new(pool)).unwrap();
        Self { db, dir, runner }
    }

    fn write(&self, filename: &str, content: &str) {
        fs::write(self.dir.path().join(filename), content).unwrap();
    }

    fn ledger(&self) -> Vec<String> {
        self.db.ledger_rows("migrations")
    }
}

fn table_migration(table: &str) -> String {
    format!(
        "CREATE TABLE {table} (id INT);\n\n-- ROLLBACK\nDROP TABLE {table};\n",
        table = table
    )
}

#[tokio::test]
async fn test_apply_runs_pending_in_filename_order() {
    let fx = Fixture::new().await;
    fx.write("20240102000000_b.sql", &table_migration("b"));
    fx.write("20240101000000_a.sql", &table_migration("a"));

    let result = fx.runner.apply_pending().await.unwrap();

    assert_eq!(
        result.applied_migrations,
        vec!["20240101000000_a.sql", "20240102000000_b.sql"]
    );
    assert_eq!(result.applied_count, 2);
    assert_eq!(result.skipped_count, 0);
    assert_eq!(fx.ledger(), result.applied_migrations);
    assert!(fx.db.has_table("a") && fx.db.has_table("b"));
}

#[tokio::test]
async fn test_second_apply_is_a_no_op() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", &table_migration("a"));

    fx.runner.apply_pending().await.unwrap();
    fx.db.clear_statements();
    let second = fx.runner.apply_pending().await.unwrap();

    assert!(second.applied_migrations.is_empty());
    assert_eq!(second.skipped_count, 1);
    assert_eq!(fx.ledger(), vec!["20240101000000_a.sql"]);
    assert!(!fx.db.statements().iter().any(|s| s.starts_with("BEGIN")));
}

#[tokio::test]
async fn test_failure_stops_the_batch() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", &table_migration("a"));
    fx.write("20240102000000_b.sql", "CREATE TABLE b (id INT);\nFAIL 42703;");
    fx.write("20240103000000_c.sql", &table_migration("c"));

    let err = fx.runner.apply_pending().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SchemaDrift);
    assert_eq!(err.context(), Some("Applying 20240102000000_b.sql"));
    assert_eq!(fx.ledger(), vec!["20240101000000_a.sql"]);
    // The failing file left nothing behind and the next one never ran.
    assert!(fx.db.has_table("a"));
    assert!(!fx.db.has_table("b"));
    assert!(!fx.db.has_table("c"));
}

#[tokio::test]
async fn test_failed_migration_can_be_fixed_and_reapplied() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", "CREATE TABLE a (id INT);\nFAIL 23502;");

    let err = fx.runner.apply_pending().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation(ConstraintKind::NotNull));
    assert!(fx.ledger().is_empty());

    fx.write("20240101000000_a.sql", &table_migration("a"));
    let result = fx.runner.apply_pending().await.unwrap();
    assert_eq!(result.applied_migrations, vec!["20240101000000_a.sql"]);
}

#[tokio::test]
async fn test_malformed_pending_file_aborts_before_running() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", &table_migration("a"));
    fx.write("20240102000000_b.sql", "-- ROLLBACK\nDROP TABLE b;");

    let err = fx.runner.apply_pending().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidMigration);
    assert!(fx.ledger().is_empty());
    assert!(!fx.db.has_table("a"));
}

#[tokio::test]
async fn test_apply_then_reverse_restores_state() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", &table_migration("a"));
    fx.runner.apply_pending().await.unwrap();

    fx.write("20240102000000_b.sql", &table_migration("b"));
    fx.runner.apply_pending().await.unwrap();
    assert!(fx.db.has_table("b"));

    let result = fx.runner.reverse_last().await.unwrap();

    assert_eq!(result.rolled_back, "20240102000000_b.sql");
    assert!(!fx.db.has_table("b"));
    assert!(fx.db.has_table("a"));
    assert_eq!(fx.ledger(), vec!["20240101000000_a.sql"]);
    assert_eq!(
        fx.runner.diff_pending().await.unwrap(),
        vec!["20240102000000_b.sql"]
    );
}

#[tokio::test]
async fn test_marker_with_note_keeps_rollback_out_of_apply() {
    let fx = Fixture::new().await;
    fx.write(
        "20240101000000_a.sql",
        "CREATE TABLE a (id INT);\n-- ROLLBACK: drop the table\nDROP TABLE a;\n",
    );

    fx.runner.apply_pending().await.unwrap();
    assert!(fx.db.has_table("a"));
    assert!(!fx.db.statements().iter().any(|s| s.starts_with("DROP")));

    let result = fx.runner.reverse_last().await.unwrap();
    assert_eq!(result.rolled_back, "20240101000000_a.sql");
    assert!(!fx.db.has_table("a"));
    assert!(fx.ledger().is_empty());
}

#[tokio::test]
async fn test_reverse_uses_application_order() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", &table_migration("a"));
    fx.write("20240102000000_b.sql", &table_migration("b"));
    // Applied out of filename order, e.g. after a branch merge.
    fx.db.seed_ledger("migrations", &["20240102000000_b.sql", "20240101000000_a.sql"]);
    fx.db.seed_ledger("a", &[]);

    let result = fx.runner.reverse_last().await.unwrap();

    assert_eq!(result.rolled_back, "20240101000000_a.sql");
    assert_eq!(fx.ledger(), vec!["20240102000000_b.sql"]);
}

#[tokio::test]
async fn test_reverse_on_empty_ledger() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", &table_migration("a"));

    let err = fx.runner.reverse_last().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NoMigrationsApplied);
    assert!(fx.db.has_table("migrations"));
    assert!(!fx.db.statements().iter().any(|s| s.starts_with("DROP")));
}

#[tokio::test]
async fn test_reverse_without_rollback_section() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", "CREATE TABLE a (id INT);");
    fx.runner.apply_pending().await.unwrap();

    let err = fx.runner.reverse_last().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NoRollbackSection);
    assert!(fx.db.has_table("a"));
    assert_eq!(fx.ledger(), vec!["20240101000000_a.sql"]);
}

#[tokio::test]
async fn test_reverse_with_missing_file() {
    let fx = Fixture::new().await;
    fx.db.seed_ledger("migrations", &["20240101000000_gone.sql"]);

    let err = fx.runner.reverse_last().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MigrationFileMissing);
    assert_eq!(fx.ledger(), vec!["20240101000000_gone.sql"]);
}

#[tokio::test]
async fn test_failed_rollback_keeps_ledger_row() {
    let fx = Fixture::new().await;
    fx.write(
        "20240101000000_a.sql",
        "CREATE TABLE a (id INT);\n-- ROLLBACK\nDROP TABLE a;\nFAIL 42P01;",
    );
    fx.runner.apply_pending().await.unwrap();

    let err = fx.runner.reverse_last().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SchemaDrift);
    assert!(fx.db.has_table("a"));
    assert_eq!(fx.ledger(), vec!["20240101000000_a.sql"]);
}

#[tokio::test]
async fn test_status_with_empty_directory() {
    let fx = Fixture::new().await;

    let status = fx.runner.status().await.unwrap();

    assert!(status.applied.is_empty());
    assert!(status.pending.is_empty());
    assert_eq!(status.summary(), "Total: 0 migrations (0 executed, 0 pending)");
    assert!(fx.db.has_table("migrations"));
}

#[tokio::test]
async fn test_partial_ledger_applies_only_the_rest() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", &table_migration("a"));
    fx.write("20240102000000_b.sql", &table_migration("b"));
    fx.write("20240103000000_c.sql", &table_migration("c"));
    fx.db.seed_ledger("migrations", &["20240101000000_a.sql"]);

    let status = fx.runner.status().await.unwrap();
    assert_eq!(status.applied.len(), 1);
    assert_eq!(status.pending, vec!["20240102000000_b.sql", "20240103000000_c.sql"]);

    let result = fx.runner.apply_pending().await.unwrap();

    assert_eq!(result.applied_migrations, status.pending);
    assert_eq!(result.skipped_count, 1);
    assert!(!fx.db.has_table("a"));
    assert!(fx.db.has_table("b") && fx.db.has_table("c"));
}

#[tokio::test]
async fn test_every_migration_gets_its_own_transaction() {
    let fx = Fixture::new().await;
    fx.write("20240101000000_a.sql", &table_migration("a"));
    fx.write("20240102000000_b.sql", &table_migration("b"));
    fx.runner.apply_pending().await.unwrap();

    let statements = fx.db.statements();
    assert_eq!(statements.iter().filter(|s| *s == "BEGIN").count(), 2);
    assert_eq!(statements.iter().filter(|s| *s == "COMMIT").count(), 2);
    assert_eq!(fx.runner.pool().stats().active_connections, 0);
}

#[tokio::test]
async fn test_created_migration_shows_as_pending() {
    let fx = Fixture::new().await;

    let filename = fx.runner.create("Create Albums").unwrap();

    assert_eq!(fx.runner.diff_pending().await.unwrap(), vec![filename]);
}

#[tokio::test]
async fn test_invalid_table_name_is_rejected() {
    let db = MemoryDatabase::new();
    let pool = db.managed_pool(PoolConfig::default()).unwrap();
    let config = MigrationConfig {
        migrations_table: "bad name".to_string(),
        ..MigrationConfig::default()
    };

    let err = MigrationRunner::new(config, Arc::new(pool)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Misconfiguration);
}
