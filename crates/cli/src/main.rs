mod commands;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use strata_core::{init_logging, AppConfig, LoggingConfig};
use strata_orm::{ClassifiedError, ManagedPool, MigrationConfig, MigrationRunner};

use commands::{check, migrate};

#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about = "Transactional schema migrations for PostgreSQL")]
struct Cli {
    /// Directory holding the migration files (overrides MIGRATIONS_DIR)
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Database connection URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations
    Up,

    /// Reverse the most recently applied migration
    Down,

    /// Show applied and pending migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a new migration file
    Create {
        /// Migration name, e.g. "create users"
        name: String,
    },

    /// Check database connectivity and pool health
    Check {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err
                .chain()
                .find_map(|cause| cause.downcast_ref::<ClassifiedError>())
            {
                Some(classified) => strata_orm::report(classified),
                None => tracing::error!("{:#}", err),
            }
            eprintln!("{} {:#}", style("error:").red().bold(), err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // A missing .env file is fine.
    dotenvy::dotenv().ok();

    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(dir) = cli.migrations_dir {
        config.migrations.directory = dir;
    }
    if let Some(url) = cli.database_url {
        config.database.url = Some(url);
    }
    config.validate().context("Invalid configuration")?;

    init_logging(LoggingConfig::from_app_config(&config).with_service("strata"))
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))?;

    let migrations = MigrationConfig::from(&config.migrations);

    // Creating a file needs no database.
    let command = match cli.command {
        Commands::Create { name } => return migrate::create(migrations, &name),
        Commands::Up => DatabaseCommand::Up,
        Commands::Down => DatabaseCommand::Down,
        Commands::Status { json } => DatabaseCommand::Status { json },
        Commands::Check { json } => DatabaseCommand::Check { json },
    };

    let pool = Arc::new(ManagedPool::postgres(&config.database)?);
    let result = dispatch(command, migrations, Arc::clone(&pool)).await;
    pool.close_all().await;
    result
}

/// Subcommands that run against the database
enum DatabaseCommand {
    Up,
    Down,
    Status { json: bool },
    Check { json: bool },
}

async fn dispatch(
    command: DatabaseCommand,
    migrations: MigrationConfig,
    pool: Arc<ManagedPool>,
) -> anyhow::Result<()> {
    match command {
        DatabaseCommand::Up => migrate::up(&MigrationRunner::new(migrations, pool)?).await,
        DatabaseCommand::Down => migrate::down(&MigrationRunner::new(migrations, pool)?).await,
        DatabaseCommand::Status { json } => {
            migrate::status(&MigrationRunner::new(migrations, pool)?, json).await
        }
        DatabaseCommand::Check { json } => check::run(&pool, json).await,
    }
}
