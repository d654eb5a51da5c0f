//! Passkey ceremony data model
//!
//! Credentials as stored, the per-ceremony user projection, the server-side
//! challenge state, and the form documents callers submit.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webauthn_rs::prelude::{DiscoverableAuthentication, PasskeyRegistration};

use crate::db::UserAccount;
use crate::error::CeremonyError;

/// COSE algorithm identifier for ECDSA P-256 with SHA-256.
pub const COSE_ALG_ES256: i64 = -7;

/// Opaque credential handle issued by an authenticator
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialHandle(Vec<u8>);

impl CredentialHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base64url form, as browsers report `credential.id`
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }
}

impl fmt::Display for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64url())
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialHandle({})", self.to_base64url())
    }
}

/// Algorithm-tagged key material handed to the verifier at login.
///
/// `encoded` holds the serialized passkey, which embeds the COSE public key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// COSE algorithm identifier
    pub algorithm: i64,
    pub encoded: Vec<u8>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("algorithm", &self.algorithm)
            .field("encoded_len", &self.encoded.len())
            .finish()
    }
}

/// A registered credential as held by the credential store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub handle: CredentialHandle,
    pub key: KeyMaterial,
    /// Authenticator model identifier (nil when the authenticator reports none)
    pub aaguid: Uuid,
    pub sign_count: u32,
    /// Set permanently once a counter regression has been observed
    pub clone_warning: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Output of a verified registration, not yet described or saved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    pub user_id: Uuid,
    pub handle: CredentialHandle,
    pub key: KeyMaterial,
    pub aaguid: Uuid,
    pub sign_count: u32,
}

/// Insert payload for the credential store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCredential {
    pub user_id: Uuid,
    pub handle: CredentialHandle,
    pub key: KeyMaterial,
    pub aaguid: Uuid,
    pub sign_count: u32,
    pub description: String,
}

impl NewCredential {
    pub fn new(verified: VerifiedCredential, description: impl Into<String>) -> Self {
        Self {
            user_id: verified.user_id,
            handle: verified.handle,
            key: verified.key,
            aaguid: verified.aaguid,
            sign_count: verified.sign_count,
            description: description.into(),
        }
    }
}

/// Result of an atomic counter update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    /// Counter value now stored, never lower than before
    pub stored: u32,
    pub clone_warning: bool,
    /// Whether this report was itself a regression
    pub regressed: bool,
}

/// True when a reported signature counter fails to advance past the stored one.
///
/// Authenticators without counters always report 0, which is exempt.
pub fn counter_regressed(stored: u32, reported: u32) -> bool {
    reported != 0 && reported <= stored
}

/// Read-only view of a user and their credentials for one ceremony
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentialSet {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    credentials: Vec<Credential>,
}

impl UserCredentialSet {
    /// Build a projection; credentials are ordered by description.
    pub fn new(
        user_id: Uuid,
        username: impl Into<String>,
        display_name: impl Into<String>,
        mut credentials: Vec<Credential>,
    ) -> Self {
        credentials.sort_by(|a, b| {
            a.description
                .cmp(&b.description)
                .then_with(|| a.handle.as_bytes().cmp(b.handle.as_bytes()))
        });

        Self {
            user_id,
            username: username.into(),
            display_name: display_name.into(),
            credentials,
        }
    }

    pub fn from_account(account: &UserAccount, credentials: Vec<Credential>) -> Self {
        Self::new(
            account.id,
            account.username.clone(),
            account.display_name(),
            credentials,
        )
    }

    /// Same identity, different credentials
    pub fn with_credentials(&self, credentials: Vec<Credential>) -> Self {
        Self::new(
            self.user_id,
            self.username.clone(),
            self.display_name.clone(),
            credentials,
        )
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    pub fn handles(&self) -> Vec<CredentialHandle> {
        self.credentials.iter().map(|c| c.handle.clone()).collect()
    }

    pub fn find(&self, handle: &CredentialHandle) -> Option<&Credential> {
        self.credentials.iter().find(|c| &c.handle == handle)
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// The two ceremony types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyKind {
    Registration,
    Login,
}

impl CeremonyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Login => "login",
        }
    }
}

impl fmt::Display for CeremonyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verifier-side state for the ceremony in flight
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub(crate) enum VerifierState {
    Registration(PasskeyRegistration),
    Login(DiscoverableAuthentication),
}

/// Server-side secret of one in-flight ceremony
///
/// Owned by exactly one browser session and consumed at most once.
#[derive(Serialize, Deserialize)]
pub struct ChallengeState {
    /// Random challenge the authenticator must sign over
    pub challenge: Vec<u8>,
    /// Registering user, or the user the login was started for
    pub user_id: Uuid,
    /// Excluded handles (registration) or allowed handles (login)
    pub credential_handles: Vec<CredentialHandle>,
    /// Advisory authenticator timeout in milliseconds
    pub timeout_ms: Option<u32>,
    pub issued_at: DateTime<Utc>,
    pub(crate) verifier: VerifierState,
}

impl ChallengeState {
    pub(crate) fn new(
        challenge: Vec<u8>,
        user_id: Uuid,
        credential_handles: Vec<CredentialHandle>,
        timeout_ms: Option<u32>,
        verifier: VerifierState,
    ) -> Self {
        Self {
            challenge,
            user_id,
            credential_handles,
            timeout_ms,
            issued_at: Utc::now(),
            verifier,
        }
    }

    pub fn kind(&self) -> CeremonyKind {
        match self.verifier {
            VerifierState::Registration(_) => CeremonyKind::Registration,
            VerifierState::Login(_) => CeremonyKind::Login,
        }
    }

    /// Whether the state is older than `ttl_secs` at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl_secs: u64) -> bool {
        let age = now.signed_duration_since(self.issued_at).num_seconds();
        age > i64::try_from(ttl_secs).unwrap_or(i64::MAX)
    }
}

impl fmt::Debug for ChallengeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeState")
            .field("kind", &self.kind())
            .field("user_id", &self.user_id)
            .field("credential_handles", &self.credential_handles.len())
            .field("timeout_ms", &self.timeout_ms)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// Registration submission: description plus the JSON authenticator response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialForm {
    pub description: String,
    pub public_key: String,
}

impl CredentialForm {
    pub fn validate(&self) -> Result<(), CeremonyError> {
        if self.description.trim().is_empty() {
            return Err(CeremonyError::MissingField("description"));
        }
        if self.public_key.trim().is_empty() {
            return Err(CeremonyError::MissingField("publicKey"));
        }
        Ok(())
    }
}

/// Login start submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginChallengeForm {
    pub username: String,
}

impl LoginChallengeForm {
    pub fn validate(&self) -> Result<(), CeremonyError> {
        if self.username.trim().is_empty() {
            return Err(CeremonyError::MissingField("username"));
        }
        Ok(())
    }
}

/// Login finish submission: username plus the JSON assertion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginVerifyForm {
    pub username: String,
    pub public_key_credential: String,
}

impl LoginVerifyForm {
    pub fn validate(&self) -> Result<(), CeremonyError> {
        if self.username.trim().is_empty() {
            return Err(CeremonyError::MissingField("username"));
        }
        if self.public_key_credential.trim().is_empty() {
            return Err(CeremonyError::MissingField("publicKeyCredential"));
        }
        Ok(())
    }
}

/// Engine output of a verified assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginVerified {
    pub user_id: Uuid,
    pub handle: CredentialHandle,
    /// Counter reported by the authenticator
    pub counter: u32,
}

/// A completed login; the caller issues the authenticated session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    pub user_id: Uuid,
    pub username: String,
    pub handle: CredentialHandle,
    pub reported_counter: u32,
    pub stored_counter: u32,
    /// The credential has shown a counter regression at some point
    pub clone_warning: bool,
}
