//! Challenge state maintenance.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use colored::Colorize;
use tracing::info;

/// Delete challenge state older than `older_than` seconds.
pub async fn purge(older_than: Option<u64>) -> Result<()> {
    let (config, storage) = super::connect().await?;

    let max_age = older_than.unwrap_or(config.challenge_ttl_secs);
    let cutoff = cutoff(Utc::now(), max_age);

    let removed = storage
        .purge_states(cutoff)
        .await
        .context("Failed to purge challenge state")?;

    info!(removed, max_age_secs = max_age, "Purged stale challenge state");
    println!(
        "{} Removed {} stale challenge state(s) older than {}s",
        "✓".green().bold(),
        removed,
        max_age
    );
    Ok(())
}

fn cutoff(now: DateTime<Utc>, max_age_secs: u64) -> DateTime<Utc> {
    i64::try_from(max_age_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
