//! Keygate configuration module
//!
//! Handles loading configuration from environment variables with sensible defaults.

use std::fmt;
use std::str::FromStr;

use crate::webauthn::StorageError;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid origin URL: {0}")]
    InvalidOrigin(String),

    #[error("WebAuthn error: {0}")]
    Webauthn(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("Entropy source unavailable: {0}")]
    Entropy(String),

    #[error("Storage initialisation failed: {0}")]
    Storage(#[from] StorageError),
}

/// What a login does when the authenticator's signature counter goes backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CounterPolicy {
    /// Accept the login and raise the credential's clone warning.
    #[default]
    Warn,
    /// Raise the clone warning and refuse the login.
    Reject,
}

impl CounterPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Reject => "reject",
        }
    }
}

impl FromStr for CounterPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(Self::Warn),
            "reject" => Ok(Self::Reject),
            other => Err(ConfigError::InvalidValue {
                name: "KEYGATE_COUNTER_POLICY",
                reason: format!("expected `warn` or `reject`, got `{other}`"),
            }),
        }
    }
}

/// Keygate configuration loaded from environment variables
#[derive(Clone)]
pub struct Config {
    /// Relying Party ID, usually the bare domain (default: localhost)
    pub rp_id: String,
    /// Relying Party origin URL (default: http://localhost:3000)
    pub rp_origin: String,
    /// Human-readable Relying Party name (default: Keygate)
    pub rp_name: String,
    /// PostgreSQL connection string; in-memory storage when unset
    pub database_url: Option<String>,
    /// Database connection pool maximum connections (default: 20)
    pub database_max_connections: u32,
    /// Database connection pool minimum connections (default: 2)
    pub database_min_connections: u32,
    /// Seconds a stored challenge stays usable (default: 300)
    pub challenge_ttl_secs: u64,
    /// Counter regression handling (default: warn)
    pub counter_policy: CounterPolicy,
    /// Key for deriving dummy credentials of unknown usernames
    pub enumeration_key: Option<[u8; 32]>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rp_id: "localhost".to_string(),
            rp_origin: "http://localhost:3000".to_string(),
            rp_name: "Keygate".to_string(),
            database_url: None,
            database_max_connections: 20,
            database_min_connections: 2,
            challenge_ttl_secs: 300,
            counter_policy: CounterPolicy::Warn,
            enumeration_key: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `WEBAUTHN_RP_ID`, `WEBAUTHN_RP_ORIGIN`, `WEBAUTHN_RP_NAME`
    /// - `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS`, `DATABASE_MIN_CONNECTIONS`
    /// - `KEYGATE_CHALLENGE_TTL_SECS`
    /// - `KEYGATE_COUNTER_POLICY` (`warn` or `reject`)
    /// - `KEYGATE_ENUMERATION_KEY` (64 hex characters)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let rp_id = std::env::var("WEBAUTHN_RP_ID").unwrap_or(defaults.rp_id);
        let rp_origin = std::env::var("WEBAUTHN_RP_ORIGIN").unwrap_or(defaults.rp_origin);
        let rp_name = std::env::var("WEBAUTHN_RP_NAME").unwrap_or(defaults.rp_name);

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.database_max_connections);

        let database_min_connections = std::env::var("DATABASE_MIN_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.database_min_connections);

        let challenge_ttl_secs = std::env::var("KEYGATE_CHALLENGE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.challenge_ttl_secs);

        let counter_policy = match std::env::var("KEYGATE_COUNTER_POLICY") {
            Ok(value) if !value.trim().is_empty() => value.parse()?,
            _ => defaults.counter_policy,
        };

        let enumeration_key = match std::env::var("KEYGATE_ENUMERATION_KEY") {
            Ok(value) if !value.trim().is_empty() => Some(parse_enumeration_key(&value)?),
            _ => None,
        };

        Ok(Self {
            rp_id,
            rp_origin,
            rp_name,
            database_url,
            database_max_connections,
            database_min_connections,
            challenge_ttl_secs,
            counter_policy,
            enumeration_key,
        })
    }
}

fn parse_enumeration_key(value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(value.trim()).map_err(|e| ConfigError::InvalidValue {
        name: "KEYGATE_ENUMERATION_KEY",
        reason: e.to_string(),
    })?;

    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| ConfigError::InvalidValue {
        name: "KEYGATE_ENUMERATION_KEY",
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("rp_id", &self.rp_id)
            .field("rp_origin", &self.rp_origin)
            .field("rp_name", &self.rp_name)
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("database_max_connections", &self.database_max_connections)
            .field("database_min_connections", &self.database_min_connections)
            .field("challenge_ttl_secs", &self.challenge_ttl_secs)
            .field("counter_policy", &self.counter_policy)
            .field("enumeration_key", &self.enumeration_key.map(|_| "<redacted>"))
            .finish()
    }
}
