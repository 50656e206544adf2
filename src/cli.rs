//! Command-line entry points. `serve` (the default) boots the full
//! application; `stats` is a one-shot introspection command that connects,
//! prints the Job Store's aggregate counts, and exits.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::app::AppState;
use crate::config::Config;
use crate::db::Database;

#[derive(Debug, Parser)]
#[command(name = "harvestd", about = "Self-hosted media acquisition orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the orchestrator: job queue workers, scheduler, announce listeners.
    Serve,
    /// Print Job Store counts and exit.
    Stats,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Stats => stats().await,
    }
}

async fn serve() -> Result<()> {
    let config = Config::from_env()?;
    let app = AppState::bootstrap(config).await?;
    app.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    Ok(())
}

async fn stats() -> Result<()> {
    let config = Config::from_env()?;
    let db = Database::connect(&config.database_url).await?;
    let stats = db.jobs().stats().await?;

    println!("pending:   {}", stats.pending);
    println!("running:   {}", stats.running);
    println!("paused:    {}", stats.paused);
    println!("completed: {}", stats.completed);
    println!("failed:    {}", stats.failed);
    println!("cancelled: {}", stats.cancelled);
    if !stats.pending_by_type.is_empty() {
        println!("pending by type:");
        let mut by_type: Vec<_> = stats.pending_by_type.iter().collect();
        by_type.sort_by(|a, b| a.0.cmp(b.0));
        for (job_type, count) in by_type {
            println!("  {job_type}: {count}");
        }
    }

    Ok(())
}
