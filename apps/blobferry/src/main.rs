//! blobferry command-line entry point.

mod app;
mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use blobferry_manager::ManagerConfig;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting blobferry");

    let config = match &cli.config {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(cli, config))
}
