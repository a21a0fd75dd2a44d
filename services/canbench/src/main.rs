use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, Level};

use canbench::cli::{self, Cli};
use canbench::CanBenchConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let config = CanBenchConfig::load(cli.config.as_deref())?;

    let mut log_config = config.log.to_log_config()?;
    if cli.verbose {
        log_config.level = Level::DEBUG;
    }
    common::logging::init_with_config(log_config).context("Failed to initialize logging")?;
    debug!("Configuration: {:?}", config);

    cli::run(cli, config).await
}
