use anyhow::{Context, Result};
use colored::Colorize;
use slotstream_pg::{CompatibilityGate, Session};

use crate::config::ProjectConfig;

pub async fn cmd_status(config: ProjectConfig, slot: Option<String>) -> Result<()> {
    let slot_name = slot.unwrap_or_else(|| config.slot.name.clone());

    let session = Session::connect(config.session_config()?)
        .await
        .context("Failed to connect to Postgres")?;

    let capabilities = *session.capabilities();
    let gate = session.gate();

    println!("\nServer:");
    println!("  {:<22} {}", "version", capabilities.version);
    if gate.is_compatible() {
        println!("  {:<22} {}", "logical slots", "supported".green());
    } else {
        println!(
            "  {:<22} {}",
            "logical slots",
            format!("unsupported (requires {})", CompatibilityGate::MINIMUM).red()
        );
    }
    println!(
        "  {:<22} {}",
        "wal position function",
        capabilities.wal_position_function.sql_name()
    );
    println!("  {:<22} {}", "current position", session.current_position().await?);

    println!("\nSlot '{}':", slot_name);
    match session.slots().slot(&slot_name).await? {
        Some(slot) => {
            let state = if slot.active {
                "active".yellow()
            } else {
                "inactive".green()
            };
            println!("  {:<22} {}", "state", state);
            println!(
                "  {:<22} {}",
                "plugin",
                slot.plugin.as_deref().unwrap_or("-")
            );
            match slot.confirmed_flush {
                Some(lsn) => println!("  {:<22} {}", "confirmed flush", lsn),
                None => println!("  {:<22} -", "confirmed flush"),
            }
        }
        None => {
            println!("  {}", "does not exist".dimmed());
        }
    }

    println!();
    Ok(())
}
