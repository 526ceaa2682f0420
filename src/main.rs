//! # Posture Analysis Service Entry Point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use posture_analysis::{config::ConfigLoader, db::init_pool, server::run_server, telemetry};
use tracing::info;

#[derive(Parser)]
#[command(name = "posture-analysis")]
#[command(about = "Asynchronous sports posture analysis service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations, then serve the HTTP API (default)
    Serve,
    /// Apply pending migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;
    telemetry::init_tracing(&config).context("failed to initialize tracing")?;

    info!(profile = %config.profile, "Configuration loaded");
    if let Ok(redacted) = config.redacted_json() {
        info!(config = %redacted, "Effective configuration");
    }

    let db = init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("failed to apply migrations")?;
    info!("Migrations applied");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => Ok(()),
        Command::Serve => run_server(config, db).await,
    }
}
