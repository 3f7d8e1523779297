// Courier task dispatch
// Main entry point for the courier binary

use clap::Parser;
use courier_engine::cli::{Cli, Command};
use courier_engine::config::Config;
use courier_engine::handlers::{
    handle_broker, handle_check, handle_coordinator, handle_worker, OutputFormat,
};
use courier_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = Config::load(cli.config.as_deref())?;

    // --log wins over the config file; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Courier v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::Broker => {
            tracing::info!("Starting bus broker on {}", config.bus.listen);
            handle_broker(&config).await
        }

        Command::Coordinator => {
            tracing::info!("Starting coordinator...");
            handle_coordinator(&config).await
        }

        Command::Worker { capability } => {
            tracing::info!("Starting {} worker...", capability);
            handle_worker(capability, &config).await
        }

        Command::Check => {
            tracing::info!("Running diagnostics...");
            handle_check(&config, format).await
        }
    }
}
