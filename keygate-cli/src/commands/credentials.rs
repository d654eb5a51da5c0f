//! Credential listing and removal commands.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use keygate_core::Credential;
use tracing::info;
use uuid::Uuid;

fn format_timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn print_credential(credential: &Credential) {
    let label = if credential.clone_warning {
        format!("{} {}", credential.description.bold(), "[possible clone]".red().bold())
    } else {
        credential.description.bold().to_string()
    };

    println!("{label}");
    println!("   {} {}", "Record ID:".dimmed(), credential.id);
    println!("   {} {}", "User ID:".dimmed(), credential.user_id);
    println!("   {} {}", "Credential:".dimmed(), credential.handle);
    println!("   {} {}", "AAGUID:".dimmed(), credential.aaguid);
    println!("   {} {}", "Sign count:".dimmed(), credential.sign_count);
    println!(
        "   {} {}",
        "Created:".dimmed(),
        format_timestamp(Some(credential.created_at))
    );
    println!(
        "   {} {}",
        "Last used:".dimmed(),
        format_timestamp(credential.last_used_at)
    );
}

/// List a user's credentials.
pub async fn list(user_id: Uuid) -> Result<()> {
    let (_, storage) = super::connect().await?;
    let credentials = storage
        .list_credentials(user_id)
        .await
        .context("Failed to list credentials")?;

    info!(user_id = %user_id, count = credentials.len(), "Listed credentials");

    if credentials.is_empty() {
        println!("No passkeys registered for {user_id}");
        return Ok(());
    }

    for credential in &credentials {
        print_credential(credential);
        println!();
    }
    Ok(())
}

/// Remove a credential owned by `user_id`.
pub async fn remove(user_id: Uuid, credential_id: Uuid) -> Result<()> {
    let (_, storage) = super::connect().await?;
    storage
        .remove_credential(user_id, credential_id)
        .await
        .with_context(|| format!("Failed to remove credential {credential_id}"))?;

    info!(user_id = %user_id, credential_record = %credential_id, "Credential removed");
    println!("{} Removed passkey {}", "✓".green().bold(), credential_id);
    Ok(())
}

/// List all credentials carrying a clone warning.
pub async fn clone_warnings() -> Result<()> {
    let (_, storage) = super::connect().await?;
    let flagged = storage
        .flagged_credentials()
        .await
        .context("Failed to list flagged credentials")?;

    if flagged.is_empty() {
        println!("{} No passkeys flagged", "✓".green().bold());
        return Ok(());
    }

    println!(
        "{} {} passkey(s) reported a signature counter regression",
        "!".yellow().bold(),
        flagged.len()
    );
    println!();
    for credential in &flagged {
        print_credential(credential);
        println!();
    }
    Ok(())
}
