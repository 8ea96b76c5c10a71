//! Entry point: wires up logging, parses the CLI, and dispatches to the
//! batch driver, the live driver, the health check, or the progress
//! viewer.

mod cache;
mod classifier;
mod cli;
mod config;
mod discovery;
mod error;
mod model;
mod orchestrator;
mod output;
mod registry;
mod sources;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("PUBLINK_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("PUBLINK_BUILD_GIT_SHA"),
        "publink starting"
    );

    let cli = cli::Cli::parse();
    let code = cli::run(cli).await;
    ExitCode::from(code)
}
