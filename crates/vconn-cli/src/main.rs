//! vconn - virtual connection layer simulator

use anyhow::Context;
use clap::Parser;
use tracing::info;

use vconn_cli::{cli::Cli, commands::CommandDispatcher, config::CliAppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_configuration(&cli)?;

    let output = CommandDispatcher::execute(cli.command, config)
        .await
        .context("command failed")?;
    println!("{}", output);
    Ok(())
}

/// Setup logging based on verbosity level. Logs go to stderr so stdout stays
/// machine-readable.
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> anyhow::Result<CliAppConfig> {
    if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path);
        CliAppConfig::load_from_file(config_path)
            .with_context(|| format!("loading {}", config_path))
    } else {
        info!("Using default configuration");
        Ok(CliAppConfig::default())
    }
}
