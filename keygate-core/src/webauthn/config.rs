//! WebAuthn Relying Party configuration
//!
//! Builds the verifier for one deployment's Relying Party identity.

use url::Url;
use webauthn_rs::prelude::*;

use crate::config::{Config, ConfigError};

/// Relying Party identity plus the verifier built for it
pub struct RelyingParty {
    webauthn: Webauthn,
    rp_id: String,
    origin: Url,
}

impl RelyingParty {
    /// Create a new Relying Party
    ///
    /// # Arguments
    ///
    /// * `rp_id` - Relying Party ID (typically the domain name)
    /// * `rp_origin` - Relying Party origin URL
    /// * `rp_name` - Human-readable name for the Relying Party
    pub fn new(rp_id: &str, rp_origin: &Url, rp_name: &str) -> Result<Self, ConfigError> {
        let builder = WebauthnBuilder::new(rp_id, rp_origin)
            .map_err(|e| ConfigError::Webauthn(format!("{e:?}")))?
            .rp_name(rp_name)
            .allow_subdomains(false);

        let webauthn = builder
            .build()
            .map_err(|e| ConfigError::Webauthn(format!("{e:?}")))?;

        Ok(Self {
            webauthn,
            rp_id: rp_id.to_string(),
            origin: rp_origin.clone(),
        })
    }

    /// Build the Relying Party from loaded configuration
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let origin = Url::parse(&config.rp_origin)
            .map_err(|e| ConfigError::InvalidOrigin(format!("{}: {}", config.rp_origin, e)))?;

        Self::new(&config.rp_id, &origin, &config.rp_name)
    }

    /// Get a reference to the Webauthn instance
    pub fn webauthn(&self) -> &Webauthn {
        &self.webauthn
    }

    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }
}

impl std::fmt::Debug for RelyingParty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelyingParty")
            .field("rp_id", &self.rp_id)
            .field("origin", &self.origin.as_str())
            .field("webauthn", &"<Webauthn instance>")
            .finish()
    }
}
