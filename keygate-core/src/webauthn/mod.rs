//! WebAuthn passkey ceremonies for Keygate
//!
//! ## Architecture
//!
//! - `config`: Relying Party identity and the verifier built for it
//! - `engine`: Registration and login ceremonies, no storage access
//! - `session`: Versioned challenge state bound to a browser session
//! - `dummy`: Deterministic stand-in credentials for anti-enumeration
//! - `attestation`: CBOR attestation object parsing
//! - `service`: Ceremony entry points combining the above with storage
//! - `storage`: PostgreSQL or in-memory credentials, session state, users
//! - `types`: Credential, projection, challenge state and form types

pub mod attestation;
mod config;
mod dummy;
mod engine;
mod service;
pub mod session;
pub mod storage;
pub mod types;

pub use config::RelyingParty;
pub use dummy::DummyCredentialGenerator;
pub use engine::CeremonyEngine;
pub use service::PasskeyService;
pub use session::{decode_state, encode_state, SessionBinding, STATE_VERSION};
pub use storage::{
    ConflictKind, CounterUpdate, MemoryStore, PostgresStore, StorageError, StorageStats,
    WebAuthnStorage,
};
pub use types::{
    counter_regressed, CeremonyKind, ChallengeState, Credential, CredentialForm, CredentialHandle,
    KeyMaterial, LoginChallengeForm, LoginSuccess, LoginVerified, LoginVerifyForm, NewCredential,
    UserCredentialSet, VerifiedCredential, COSE_ALG_ES256,
};
