//! CLI interface for Courier
//!
//! Every role of the system is a subcommand of the same binary. Each role is
//! an independent long-running process; they share nothing but the bus.

use clap::{Parser, Subcommand};
use courier_sdk::Capability;
use std::path::PathBuf;

/// Courier task dispatch
///
/// Analyzes documents, voice messages and photos sent to a Telegram bot,
/// using one worker process per capability behind a publish/subscribe bus.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the message bus broker
    Broker,

    /// Run the coordinator with the Telegram front end
    Coordinator,

    /// Run a worker for one capability
    Worker {
        /// Capability to serve (document, audio, image)
        #[arg(value_parser = parse_capability)]
        capability: Capability,
    },

    /// Check configuration, credentials and live workers
    Check,
}

fn parse_capability(value: &str) -> Result<Capability, String> {
    value.parse().map_err(|e: courier_sdk::DispatchError| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["courier", "broker"]);
        assert!(matches!(cli.command, Command::Broker));
        assert!(!cli.json);
        assert!(cli.log.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from([
            "courier",
            "--json",
            "--log",
            "debug",
            "--config",
            "/etc/courier.toml",
            "check",
        ]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/courier.toml")));
        assert!(matches!(cli.command, Command::Check));
    }

    #[test]
    fn test_worker_capability() {
        let cli = Cli::parse_from(["courier", "worker", "audio"]);
        if let Command::Worker { capability } = cli.command {
            assert_eq!(capability, Capability::Audio);
        } else {
            panic!("Expected Worker command");
        }
    }

    #[test]
    fn test_unknown_capability_rejected() {
        assert!(Cli::try_parse_from(["courier", "worker", "video"]).is_err());
    }
}
