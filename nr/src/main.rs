//! newsrecap - CLI entry point
//!
//! Parses the command line, initializes tracing, and dispatches to the
//! ingestion pipeline, queue worker, task inspection, or recap commands.

use clap::Parser;
use eyre::{Context, Result};

use newsrecap::cli::{self, Cli};

fn setup_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;
    let cli = Cli::parse();
    cli::execute(cli).await
}
