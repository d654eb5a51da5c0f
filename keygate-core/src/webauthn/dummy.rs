//! Anti-enumeration dummy credentials
//!
//! A login for an unknown username, or for a user with no passkeys, gets a
//! credential derived from the username under a deployment key. The same
//! username always yields the same handle, so repeated lookups cannot tell a
//! dummy from a real credential by watching the allow list change.

use chrono::{DateTime, Utc};
use sha3::{Digest, Sha3_256};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::{Config, ConfigError};

use super::types::{Credential, CredentialHandle, KeyMaterial, UserCredentialSet, COSE_ALG_ES256};

const HANDLE_LABEL: &[u8] = b"keygate/dummy/handle/v1";
const KEY_LABEL: &[u8] = b"keygate/dummy/key/v1";
const RECORD_LABEL: &[u8] = b"keygate/dummy/record/v1";

/// Derives deterministic dummy credentials from usernames
pub struct DummyCredentialGenerator {
    key: Zeroizing<[u8; 32]>,
}

impl DummyCredentialGenerator {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Fresh key from the OS entropy source, valid for this process only
    pub fn random() -> Result<Self, getrandom::Error> {
        let mut key = Zeroizing::new([0u8; 32]);
        getrandom::fill(key.as_mut_slice())?;
        Ok(Self { key })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        match config.enumeration_key {
            Some(key) => Ok(Self::new(key)),
            None => {
                tracing::warn!(
                    rp_id = %config.rp_id,
                    "KEYGATE_ENUMERATION_KEY not set, using a random per-process key; \
                     dummy credentials change on restart and differ between replicas"
                );
                Self::random().map_err(|e| ConfigError::Entropy(e.to_string()))
            }
        }
    }

    fn derive(&self, label: &[u8], username: &str) -> [u8; 32] {
        let normalized = username.trim().to_lowercase();

        let mut hasher = Sha3_256::new();
        hasher.update(self.key.as_slice());
        hasher.update(label);
        hasher.update((normalized.len() as u64).to_be_bytes());
        hasher.update(normalized.as_bytes());
        hasher.finalize().into()
    }

    /// The dummy credential for a username
    ///
    /// Its key material is not a decodable passkey, so any assertion against
    /// it fails verification.
    pub fn credential_for(&self, username: &str) -> Credential {
        let record = self.derive(RECORD_LABEL, username);
        let mut id = [0u8; 16];
        id.copy_from_slice(&record[..16]);

        Credential {
            id: Uuid::from_bytes(id),
            user_id: Uuid::nil(),
            handle: CredentialHandle::new(self.derive(HANDLE_LABEL, username).to_vec()),
            key: KeyMaterial {
                algorithm: COSE_ALG_ES256,
                encoded: self.derive(KEY_LABEL, username).to_vec(),
            },
            aaguid: Uuid::nil(),
            sign_count: 0,
            clone_warning: false,
            description: String::new(),
            created_at: DateTime::<Utc>::default(),
            last_used_at: None,
        }
    }

    /// A complete stand-in projection for a username that does not exist
    pub fn credential_set_for(&self, username: &str) -> UserCredentialSet {
        UserCredentialSet::new(
            Uuid::nil(),
            username,
            username,
            vec![self.credential_for(username)],
        )
    }

    /// Fill an empty projection with the dummy credential, keeping identity
    pub fn substitute(&self, set: &UserCredentialSet) -> UserCredentialSet {
        if set.is_empty() {
            set.with_credentials(vec![self.credential_for(&set.username)])
        } else {
            set.clone()
        }
    }
}

impl std::fmt::Debug for DummyCredentialGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyCredentialGenerator")
            .field("key", &"<redacted>")
            .finish()
    }
}
