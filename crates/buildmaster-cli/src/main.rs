//! buildmaster CLI.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildmaster")]
#[command(about = "Build master for CI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a master configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "master.kdl")]
        path: String,
    },
    /// Run a master until interrupted
    Run {
        /// Path to the configuration file
        #[arg(default_value = "master.kdl")]
        path: String,
        /// PostgreSQL URL; without one, state is kept in memory
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Run { path, database_url } => {
            commands::run::run_master(&path, database_url.as_deref()).await?;
        }
    }

    Ok(())
}
