//! cube-castle sync server
//!
//! Relays committed outbox rows onto the in-process event bus and keeps the
//! graph store in step with the relational store.

mod startup;

use anyhow::Context;
use clap::Parser;
use cube_castle_shared::config::ConfigLoader;
use cube_castle_sync_infrastructure::{PostgresOutboxRepository, connect_pool};
use startup::SyncPipeline;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// CLI arguments for cube-castle-sync
#[derive(clap::Parser, Debug)]
#[command(name = "cube-castle-sync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Outbox dispatcher and graph sync for cube-castle", long_about = None)]
struct Args {
    /// Optional .env file loaded before the process environment
    #[arg(short, long)]
    env_file: Option<PathBuf>,

    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.debug)?;

    let config = ConfigLoader::new(args.env_file)
        .load_pipeline_config()
        .context("loading configuration")?;

    let pool = connect_pool(&config.database)
        .await
        .context("connecting to PostgreSQL")?;
    let outbox = PostgresOutboxRepository::new(pool.clone());
    outbox
        .run_migrations()
        .await
        .context("creating outbox schema")?;

    let shutdown = CancellationToken::new();
    let pipeline = SyncPipeline::build(&config, Arc::new(outbox), shutdown.clone())?;
    pipeline.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down gracefully...");

    pipeline.stop().await;
    pool.close().await;
    Ok(())
}

/// Setup logging based on debug flag.
fn setup_logging(debug: bool) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_env_file() {
        let args = Args::try_parse_from(["cube-castle-sync", "--env-file", ".env.test", "-d"])
            .unwrap();
        assert_eq!(args.env_file, Some(PathBuf::from(".env.test")));
        assert!(args.debug);
    }
}
