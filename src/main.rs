use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use warden::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    cli.execute().await.context("warden exited with an error")?;

    Ok(())
}
