use anyhow::{Context, Result};
use colored::Colorize;
use slotstream_pg::Session;

use crate::config::ProjectConfig;

pub async fn cmd_drop_slot(config: ProjectConfig, slot: Option<String>) -> Result<()> {
    let slot_name = slot.unwrap_or_else(|| config.slot.name.clone());

    let session = Session::connect(config.session_config()?)
        .await
        .context("Failed to connect to Postgres")?;

    let slots = session.slots().with_wait(config.inactive_wait());
    if slots.slot(&slot_name).await?.is_none() {
        println!("Slot '{}' does not exist.", slot_name);
        return Ok(());
    }

    slots
        .drop_slot(&slot_name)
        .await
        .with_context(|| format!("Failed to drop slot '{}'", slot_name))?;

    println!("{}", format!("Dropped slot '{}'.", slot_name).green());
    Ok(())
}
