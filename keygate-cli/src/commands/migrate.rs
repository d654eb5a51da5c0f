//! Migrate command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;

/// Execute the migrate command.
pub async fn execute() -> Result<()> {
    let (_, storage) = super::connect().await?;
    storage.migrate().await.context("Migration failed")?;

    let stats = storage.stats().await.context("Could not read storage statistics")?;
    info!(
        credentials = stats.credentials,
        pending_states = stats.pending_states,
        "Database schema up to date"
    );

    println!("{} Database schema is up to date", "✓".green().bold());
    println!("   {} {}", "Credentials:".dimmed(), stats.credentials);
    println!("   {} {}", "Pending challenges:".dimmed(), stats.pending_states);
    Ok(())
}
