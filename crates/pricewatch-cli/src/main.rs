use anyhow::Result;
use clap::Parser;
use pricewatch_cli::{run_cli, Cli};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    run_cli(Cli::parse())
}
