//! oneembed - command-line tools for the tiered embedding engine.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use oneembed_cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("oneembed=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate(cmd) => cmd.run(),
        Commands::Inspect(cmd) => cmd.run(),
        Commands::Bench(cmd) => cmd.run(),
    }
}
