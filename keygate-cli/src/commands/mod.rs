//! Command implementations.

pub mod credentials;
pub mod migrate;
pub mod sessions;

use anyhow::{bail, Context, Result};
use keygate_core::{Config, WebAuthnStorage};

/// Load configuration and connect to the database, running pending migrations.
///
/// Every command operates on persistent storage; the in-memory fallback is
/// refused here.
pub async fn connect() -> Result<(Config, WebAuthnStorage)> {
    let config = Config::from_env().context("Invalid configuration")?;

    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL is not set");
    };

    let storage = WebAuthnStorage::with_postgres(
        url,
        config.database_max_connections,
        config.database_min_connections,
    )
    .await
    .context("Failed to connect to database")?;

    Ok((config, storage))
}
