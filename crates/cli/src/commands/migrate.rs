use console::style;
use strata_orm::{MigrationConfig, MigrationManager, MigrationRunner, MigrationStatusReport};

pub async fn up(runner: &MigrationRunner) -> anyhow::Result<()> {
    let result = runner.apply_pending().await?;

    if result.applied_migrations.is_empty() {
        println!("Nothing to migrate.");
        return Ok(());
    }

    for filename in &result.applied_migrations {
        println!("{} Applied {}", style("✓").green(), filename);
    }
    println!(
        "Applied {} migration(s) in {}ms",
        result.applied_count, result.execution_time_ms
    );
    Ok(())
}

pub async fn down(runner: &MigrationRunner) -> anyhow::Result<()> {
    let result = runner.reverse_last().await?;
    println!(
        "{} Rolled back {} in {}ms",
        style("✓").green(),
        result.rolled_back,
        result.execution_time_ms
    );
    Ok(())
}

pub async fn status(runner: &MigrationRunner, json: bool) -> anyhow::Result<()> {
    let report = runner.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_status(&report));
    }
    Ok(())
}

pub fn create(config: MigrationConfig, name: &str) -> anyhow::Result<()> {
    let manager = MigrationManager::with_config(config);
    let filename = manager.create_migration(name)?;
    println!(
        "{} Created migration: {}",
        style("✓").green(),
        manager.path_for(&filename).display()
    );
    Ok(())
}

/// Applied migrations in ledger order, then pending ones, then the totals
pub fn render_status(report: &MigrationStatusReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", style("=== Migration Status ===").bold()));

    if report.total() == 0 {
        out.push_str("No migrations found.\n\n");
    }

    for record in &report.applied {
        out.push_str(&format!(
            "{} {}  (executed {})\n",
            style("✓").green(),
            record.filename,
            record.executed_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    for filename in &report.pending {
        out.push_str(&format!("{} {}  (pending)\n", style("○").yellow(), filename));
    }
    if report.total() > 0 {
        out.push('\n');
    }

    out.push_str(&report.summary());
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use std::sync::Arc;
    use strata_orm::{MemoryDatabase, MigrationRecord, PoolConfig};
    use tempfile::TempDir;

    #[test]
    fn test_render_status() {
        let report = MigrationStatusReport {
            applied: vec![MigrationRecord {
                filename: "20240101000000_a.sql".to_string(),
                executed_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            }],
            pending: vec!["20240102000000_b.sql".to_string()],
        };

        let rendered = console::strip_ansi_codes(&render_status(&report)).to_string();

        assert_eq!(
            rendered,
            "=== Migration Status ===\n\n\
             ✓ 20240101000000_a.sql  (executed 2024-01-02 03:04:05 UTC)\n\
             ○ 20240102000000_b.sql  (pending)\n\n\
             Total: 2 migrations (1 executed, 1 pending)\n"
        );
    }

    #[test]
    fn test_render_empty_status() {
        let report = MigrationStatusReport {
            applied: Vec::new(),
            pending: Vec::new(),
        };

        let rendered = console::strip_ansi_codes(&render_status(&report)).to_string();

        assert!(rendered.contains("No migrations found."));
        assert!(rendered.ends_with("Total: 0 migrations (0 executed, 0 pending)\n"));
    }

    #[test]
    fn test_create_writes_into_configured_directory() {
        let dir = TempDir::new().unwrap();
        let config = MigrationConfig {
            migrations_dir: dir.path().join("db"),
            ..MigrationConfig::default()
        };

        create(config, "Add Users").unwrap();

        let files: Vec<_> = fs::read_dir(dir.path().join("db"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("_add_users.sql"));
    }

    #[tokio::test]
    async fn test_up_then_down() {
        let db = MemoryDatabase::new();
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("20240101000000_a.sql"),
            "CREATE TABLE a (id INT);\n-- ROLLBACK\nDROP TABLE a;",
        )
        .unwrap();

        let pool = db.managed_pool(PoolConfig::default()).unwrap();
        let config = MigrationConfig {
            migrations_dir: dir.path().to_path_buf(),
            ..MigrationConfig::default()
        };
        let runner = MigrationRunner::new(config, Arc::new(pool)).unwrap();

        up(&runner).await.unwrap();
        assert!(db.has_table("a"));

        down(&runner).await.unwrap();
        assert!(!db.has_table("a"));

        let err = down(&runner).await.unwrap_err();
        let classified = err.downcast_ref::<strata_orm::ClassifiedError>().unwrap();
        assert_eq!(classified.kind(), strata_orm::ErrorKind::NoMigrationsApplied);
    }
}
