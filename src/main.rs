//! harvestd — self-hosted media acquisition orchestrator.

mod adapters;
mod app;
mod cli;
mod config;
mod db;
mod error;
mod events;
mod services;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harvestd=info,sqlx=warn".into()),
        )
        .json()
        .init();

    cli::run().await
}
