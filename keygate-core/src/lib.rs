//! Keygate Library - passwordless passkey ceremonies
//!
//! Registration and login over WebAuthn, with single-use challenge state bound
//! to browser sessions and dummy credentials that keep usernames from being
//! enumerated. HTTP routing and session issuance belong to the host application.

pub mod config;
pub mod db;
pub mod error;
pub mod webauthn;

pub use config::{Config, ConfigError, CounterPolicy};
pub use db::{UserAccount, UserRepository};
pub use error::{CeremonyError, CeremonyFailure, ErrorCategory, ErrorCode};
pub use webauthn::{
    CeremonyEngine, CeremonyKind, ChallengeState, Credential, CredentialForm, CredentialHandle,
    DummyCredentialGenerator, LoginChallengeForm, LoginSuccess, LoginVerifyForm, MemoryStore,
    PasskeyService, RelyingParty, SessionBinding, StorageError, StorageStats,
    UserCredentialSet, WebAuthnStorage,
};
