//! Challenge state persistence bound to a browser session
//!
//! The state travels as a versioned JSON envelope so a schema change shows up
//! as a decode error rather than a silently missing challenge.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CeremonyError;

use super::storage::WebAuthnStorage;
use super::types::ChallengeState;

/// Current envelope version
pub const STATE_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u32,
    state: &'a ChallengeState,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    state: serde_json::Value,
}

/// Serialize a challenge state into its storage envelope
pub fn encode_state(state: &ChallengeState) -> Result<String, CeremonyError> {
    serde_json::to_string(&EnvelopeRef {
        v: STATE_VERSION,
        state,
    })
    .map_err(|e| CeremonyError::CorruptState(e.to_string()))
}

/// Decode a stored envelope, rejecting unknown versions
pub fn decode_state(encoded: &str) -> Result<ChallengeState, CeremonyError> {
    let envelope: Envelope =
        serde_json::from_str(encoded).map_err(|e| CeremonyError::CorruptState(e.to_string()))?;

    if envelope.v != STATE_VERSION {
        return Err(CeremonyError::CorruptState(format!(
            "unsupported state version {}",
            envelope.v
        )));
    }

    serde_json::from_value(envelope.state).map_err(|e| CeremonyError::CorruptState(e.to_string()))
}

/// One session's slot in the challenge state store
pub struct SessionBinding<'a> {
    storage: &'a WebAuthnStorage,
    session_id: &'a str,
    ttl_secs: u64,
}

impl<'a> SessionBinding<'a> {
    pub fn new(storage: &'a WebAuthnStorage, session_id: &'a str, ttl_secs: u64) -> Self {
        Self {
            storage,
            session_id,
            ttl_secs,
        }
    }

    /// Store the state, replacing whatever the session held
    pub async fn put(&self, state: &ChallengeState) -> Result<(), CeremonyError> {
        let encoded = encode_state(state)?;
        self.storage.put_state(self.session_id, encoded).await?;

        tracing::debug!(
            session = %self.session_id,
            kind = %state.kind(),
            "Challenge state stored"
        );
        Ok(())
    }

    /// Remove and return the state; at most one caller ever gets it
    pub async fn take_and_clear(&self) -> Result<ChallengeState, CeremonyError> {
        let (encoded, written_at) = self
            .storage
            .take_state(self.session_id)
            .await?
            .ok_or(CeremonyError::ChallengeExpiredOrMissing)?;

        let state = decode_state(&encoded)?;

        let now = Utc::now();
        let stale = now.signed_duration_since(written_at).num_seconds()
            > i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        if stale || state.is_expired_at(now, self.ttl_secs) {
            tracing::debug!(session = %self.session_id, "Challenge state expired");
            return Err(CeremonyError::ChallengeExpiredOrMissing);
        }

        Ok(state)
    }
}

impl std::fmt::Debug for SessionBinding<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBinding")
            .field("session_id", &self.session_id)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{Config, CounterPolicy};
    use crate::db::UserAccount;
    use crate::webauthn::config::RelyingParty;
    use crate::webauthn::engine::CeremonyEngine;
    use crate::webauthn::types::{CeremonyKind, UserCredentialSet};

    fn registration_state() -> ChallengeState {
        let rp = RelyingParty::from_config(&Config::default()).unwrap();
        let engine = CeremonyEngine::new(rp, CounterPolicy::Warn);
        let user = UserAccount::new("alice", None);
        let set = UserCredentialSet::from_account(&user, vec![]);
        let (_, state) = engine.begin_registration(&set).unwrap();
        state
    }

    #[test]
    fn test_envelope_round_trip() {
        let state = registration_state();
        let encoded = encode_state(&state).unwrap();
        assert!(encoded.starts_with("{\"v\":1,"));

        let decoded = decode_state(&encoded).unwrap();
        assert_eq!(decoded.kind(), CeremonyKind::Registration);
        assert_eq!(decoded.challenge, state.challenge);
        assert_eq!(decoded.user_id, state.user_id);
        assert_eq!(decoded.issued_at, state.issued_at);
    }

    #[test]
    fn test_unknown_version_is_corrupt() {
        let encoded = encode_state(&registration_state()).unwrap();
        let bumped = encoded.replacen("{\"v\":1,", "{\"v\":2,", 1);

        assert!(matches!(
            decode_state(&bumped),
            Err(CeremonyError::CorruptState(_))
        ));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(matches!(
            decode_state("not json"),
            Err(CeremonyError::CorruptState(_))
        ));
        assert!(matches!(
            decode_state(r#"{"v":1,"state":{"challenge":[]}}"#),
            Err(CeremonyError::CorruptState(_))
        ));
    }

    #[tokio::test]
    async fn test_take_and_clear_once() {
        let storage = WebAuthnStorage::in_memory();
        let binding = SessionBinding::new(&storage, "session-1", 300);

        binding.put(&registration_state()).await.unwrap();
        assert!(binding.take_and_clear().await.is_ok());
        assert!(matches!(
            binding.take_and_clear().await,
            Err(CeremonyError::ChallengeExpiredOrMissing)
        ));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let storage = WebAuthnStorage::in_memory();
        SessionBinding::new(&storage, "a", 300)
            .put(&registration_state())
            .await
            .unwrap();

        let other = SessionBinding::new(&storage, "b", 300);
        assert!(matches!(
            other.take_and_clear().await,
            Err(CeremonyError::ChallengeExpiredOrMissing)
        ));
        assert!(SessionBinding::new(&storage, "a", 300)
            .take_and_clear()
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_expired_state_is_missing() {
        let storage = WebAuthnStorage::in_memory();
        let binding = SessionBinding::new(&storage, "session-1", 300);

        let mut state = registration_state();
        state.issued_at = Utc::now() - chrono::Duration::seconds(301);
        binding.put(&state).await.unwrap();

        assert!(matches!(
            binding.take_and_clear().await,
            Err(CeremonyError::ChallengeExpiredOrMissing)
        ));
        assert_eq!(storage.stats().await.unwrap().pending_states, 0);
    }

    #[tokio::test]
    async fn test_concurrent_takes_single_winner() {
        let storage = Arc::new(WebAuthnStorage::in_memory());
        SessionBinding::new(&storage, "session-1", 300)
            .put(&registration_state())
            .await
            .unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let storage = storage.clone();
                tokio::spawn(async move {
                    SessionBinding::new(&storage, "session-1", 300)
                        .take_and_clear()
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
