use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use slotstream_pg::{ErrorKind, PgError};
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod env;
mod sink;

use cli::{Cli, Commands, FormatArg};
use commands::{cmd_drop_slot, cmd_run, cmd_status, RunOverrides};
use config::{OutputFormat, ProjectConfig};

#[tokio::main]
async fn main() {
    // Changes go to stdout, so logs stay on stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slotstream=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), err);
        std::process::exit(exit_code(&err));
    }
}

async fn run(cli: Cli) -> Result<()> {
    env::load_env(cli.env.as_deref())?;
    let config = ProjectConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run {
            slot,
            plugin,
            resume,
            poll,
            format,
        } => {
            let overrides = RunOverrides {
                slot,
                plugin,
                resume,
                poll,
                format: format.map(|f| match f {
                    FormatArg::Text => OutputFormat::Text,
                    FormatArg::Json => OutputFormat::Json,
                }),
            };
            cmd_run(config, overrides).await
        }
        Commands::Status { slot } => cmd_status(config, slot).await,
        Commands::DropSlot { slot } => cmd_drop_slot(config, slot).await,
    }
}

/// Process exit status for a failed run, by the kind of replication error behind it.
fn exit_code(err: &anyhow::Error) -> i32 {
    let kind = err
        .chain()
        .find_map(|e| e.downcast_ref::<PgError>())
        .map(PgError::kind);

    match kind {
        Some(ErrorKind::Incompatible) => 2,
        Some(ErrorKind::Timeout) => 3,
        Some(ErrorKind::Protocol) => 4,
        Some(ErrorKind::Decode) => 5,
        Some(ErrorKind::Connection) => 6,
        Some(ErrorKind::Sink) => 7,
        None => 1,
    }
}
