//! Rollup - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollup_common::logging::{init_logging, LogConfig, LogLevel};
use serde::Serialize;
use serde_json::json;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use rollup_server::{
    config::Config,
    db,
    query::QueryGenerator,
    registry::Registry,
    service::AggregateService,
};

/// Rollup - materialized aggregate maintenance
#[derive(Parser, Debug)]
#[command(name = "rollup")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run startup checks, then repair periodically until interrupted
    Serve,

    /// Apply database migrations (creates the development source table)
    Migrate,

    /// Add missing columns to existing aggregate tables
    Validate,

    /// Report drift between the source table and every aggregate table
    Check,

    /// Check every aggregate table and repair whatever drifted
    Repair,

    /// Rebuild aggregate rows for the given entities
    Sync {
        /// Only rebuild this table
        #[arg(short, long)]
        table: Option<String>,

        /// Entity identifiers (e.g. store codes)
        #[arg(required = true)]
        entities: Vec<String>,
    },

    /// Print the statements a sync would run, without touching the database
    Plan {
        #[arg(short, long)]
        table: String,

        #[arg(required = true)]
        entities: Vec<String>,
    },

    /// List registered aggregate tables and their expected schemas
    Tables,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("rollup")
        .filter_directives("sqlx=warn")
        .build();

    let log_config = with_env_overrides(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    if let Err(e) = run(cli.command).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

/// Environment variables take precedence. A malformed one discards every
/// override and is reported on stderr.
fn with_env_overrides(log_config: LogConfig) -> LogConfig {
    match log_config.clone().apply_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring LOG_* overrides: {:#}", e);
            log_config
        },
    }
}

async fn run(command: Commands) -> Result<()> {
    let registry = Arc::new(Registry::builtin().context("Invalid built-in aggregate registry")?);

    match command {
        Commands::Plan { table, entities } => {
            let statements = QueryGenerator::new(&registry).sync_statements(&table, &entities)?;
            print_json(&statements)
        },
        Commands::Tables => {
            let tables: Vec<_> = registry
                .tables()
                .iter()
                .map(|t| json!({ "config": t, "schema": registry.schema(&t.table_name) }))
                .collect();
            print_json(&json!({ "source": registry.source(), "tables": tables }))
        },
        command => {
            let config = Config::load()?;
            let pool = db::create_pool(&config.database)
                .await
                .context("Failed to connect to database")?;

            if let Commands::Migrate = command {
                sqlx::migrate!("../../migrations")
                    .run(&pool)
                    .await
                    .context("Failed to run migrations")?;
                info!("Database migrations completed");
                return Ok(());
            }

            let service = Arc::new(AggregateService::new(pool, registry, config.aggregates));

            match command {
                Commands::Serve => serve(service).await,
                Commands::Validate => print_json(&service.validate_schema().await?),
                Commands::Check => print_json(&service.check_consistency().await?),
                Commands::Repair => print_json(&service.check_and_repair().await?),
                Commands::Sync {
                    table: Some(table),
                    entities,
                } => print_json(&service.sync_table(&table, &entities).await?),
                Commands::Sync {
                    table: None,
                    entities,
                } => print_json(&service.sync_partitions(&entities).await?),
                Commands::Plan { .. } | Commands::Tables | Commands::Migrate => Ok(()),
            }
        },
    }
}

async fn serve(service: Arc<AggregateService>) -> Result<()> {
    info!("Starting rollup service");

    let startup = service.startup().await.context("Startup repair failed")?;
    info!(
        schema_success = startup.schema.success,
        columns_added = startup.schema.added.len(),
        status = ?startup.repair.status,
        "Startup checks completed"
    );

    let periodic = if service.settings().periodic_repair {
        let period = service.settings().repair_interval();
        Some(Arc::clone(&service).spawn_periodic(period))
    } else {
        info!("Periodic repair is disabled (ROLLUP_PERIODIC_REPAIR=false)");
        None
    };

    shutdown_signal().await;

    if let Some(handle) = periodic {
        handle.abort();
    }
    info!("Rollup service stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
