use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "slotstream")]
#[command(about = "Recreate a logical replication slot and stream its changes")]
#[command(version)]
pub struct Cli {
    /// Environment to load (loads .env.{ENV} instead of .env)
    #[arg(short, long, global = true)]
    pub env: Option<String>,

    /// Path to slotstream.toml config file
    #[arg(short, long, global = true, default_value = "slotstream.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Recreate the slot and stream changes to stdout until interrupted
    Run {
        /// Replication slot name (overrides config)
        #[arg(long)]
        slot: Option<String>,

        /// Output plugin (overrides config)
        #[arg(long)]
        plugin: Option<String>,

        /// Keep an existing slot instead of recreating it
        #[arg(long)]
        resume: bool,

        /// Poll for data instead of waiting on the socket
        #[arg(long)]
        poll: bool,

        /// Output format for changes (overrides config)
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },

    /// Show server compatibility, WAL position and slot state
    Status {
        /// Replication slot name (overrides config)
        #[arg(long)]
        slot: Option<String>,
    },

    /// Terminate any holder of the slot and drop it
    DropSlot {
        /// Replication slot name (overrides config)
        #[arg(long)]
        slot: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::try_parse_from([
            "slotstream",
            "--env",
            "staging",
            "run",
            "--slot",
            "orders",
            "--resume",
            "--format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.env.as_deref(), Some("staging"));
        assert_eq!(cli.config, PathBuf::from("slotstream.toml"));
        match cli.command {
            Commands::Run {
                slot,
                resume,
                poll,
                format,
                ..
            } => {
                assert_eq!(slot.as_deref(), Some("orders"));
                assert!(resume);
                assert!(!poll);
                assert_eq!(format, Some(FormatArg::Json));
            }
            _ => panic!("expected run"),
        }
    }
}
