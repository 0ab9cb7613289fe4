use anyhow::{Context, Result};
use colored::Colorize;
use slotstream_pg::publication::{
    create_publication_all_tables, publication_exists, recreate_publication,
};
use slotstream_pg::{Session, SlotPolicy, StopReason, StreamConsumer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{OutputFormat, ProjectConfig, WaitMode};
use crate::sink::LineSink;

/// Command-line values that take precedence over slotstream.toml.
#[derive(Debug, Default)]
pub struct RunOverrides {
    pub slot: Option<String>,
    pub plugin: Option<String>,
    pub resume: bool,
    pub poll: bool,
    pub format: Option<OutputFormat>,
}

impl RunOverrides {
    fn apply(self, config: &mut ProjectConfig) {
        if let Some(slot) = self.slot {
            config.slot.name = slot;
        }
        if let Some(plugin) = self.plugin {
            config.slot.plugin = plugin;
        }
        if self.resume {
            config.slot.policy = SlotPolicy::ResumeIfExists;
        }
        if self.poll {
            config.stream.wait = WaitMode::Poll;
        }
        if let Some(format) = self.format {
            config.output.format = format;
        }
    }
}

pub async fn cmd_run(mut config: ProjectConfig, overrides: RunOverrides) -> Result<()> {
    overrides.apply(&mut config);
    info!(slot = %config.slot.name, plugin = %config.slot.plugin, "Starting slotstream");

    let mut session = Session::connect(config.session_config()?)
        .await
        .context("Failed to connect to Postgres")?;
    session.gate().ensure()?;

    if let Some(publication) = &config.publication {
        if publication.recreate {
            recreate_publication(session.control(), &publication.name).await?;
        } else if !publication_exists(session.control(), &publication.name).await? {
            create_publication_all_tables(session.control(), &publication.name).await?;
        }
    }

    let prepared = session
        .slots()
        .with_wait(config.inactive_wait())
        .prepare(&config.slot.name, &config.slot.plugin, config.slot.policy)
        .await
        .with_context(|| format!("Failed to prepare slot '{}'", config.slot.name))?;

    // A fresh slot has nothing before the current write position; a resumed
    // one continues from what it last confirmed.
    let start = if prepared.created {
        session.current_position().await?
    } else {
        prepared.position
    };
    info!(slot = %prepared.name, start = %start, created = prepared.created, "Slot ready");

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            signal_token.cancel();
        }
    });

    let mut sink = LineSink::stdout(config.output.format);
    let result = match session.open_replication().await {
        Ok(transport) => {
            let mut consumer = StreamConsumer::new(transport, config.consumer_options());
            consumer
                .consume(&prepared.name, start, &mut sink, &cancel)
                .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close streaming session cleanly");
    }

    let summary = result.with_context(|| format!("Streaming from slot '{}' failed", prepared.name))?;

    let stopped = match summary.stop {
        StopReason::Cancelled => "Stopped",
        StopReason::StreamEnded => "Server ended the stream",
    };
    eprintln!();
    eprintln!("{}", stopped.bold());
    eprintln!("  {:<16} {}", "changes", summary.records);
    if summary.skipped > 0 {
        eprintln!("  {:<16} {}", "skipped", summary.skipped.to_string().yellow());
    }
    eprintln!("  {:<16} {}", "keepalives", summary.keepalives);
    eprintln!("  {:<16} {}", "statuses sent", summary.statuses_sent);
    eprintln!("  {:<16} {}", "last received", summary.last_received);
    eprintln!("  {:<16} {}", "flushed", summary.feedback.flushed.to_string().green());

    Ok(())
}
