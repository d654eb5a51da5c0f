//! Registration and login ceremonies
//!
//! `begin_*` produces the options document for the browser plus the state the
//! caller must persist; `finish_*` consumes that state exactly once. The engine
//! never touches storage.
//!
//! Login always goes through the discoverable-credential verifier with the
//! allow list filled in from the user's credentials. A real user and a dummy
//! projection therefore produce the same document shape.

use webauthn_rs::prelude::{
    CreationChallengeResponse, CredentialID, DiscoverableKey, Passkey, PublicKeyCredential,
    RegisterPublicKeyCredential, RequestChallengeResponse, WebauthnError,
};
use webauthn_rs::prelude::Credential as VerifierCredential;
use webauthn_rs_proto::AllowCredentials;

use crate::config::CounterPolicy;
use crate::error::CeremonyError;

use super::attestation::parse_attestation_object;
use super::config::RelyingParty;
use super::types::{
    counter_regressed, CeremonyKind, ChallengeState, CredentialHandle, KeyMaterial, LoginVerified,
    UserCredentialSet, VerifiedCredential, VerifierState,
};

fn to_bytes<T: AsRef<[u8]>>(data: &T) -> Vec<u8> {
    data.as_ref().to_vec()
}

/// Stateless ceremony driver for one relying party
#[derive(Debug)]
pub struct CeremonyEngine {
    relying_party: RelyingParty,
    counter_policy: CounterPolicy,
}

impl CeremonyEngine {
    pub fn new(relying_party: RelyingParty, counter_policy: CounterPolicy) -> Self {
        Self {
            relying_party,
            counter_policy,
        }
    }

    pub fn counter_policy(&self) -> CounterPolicy {
        self.counter_policy
    }

    /// Start a registration for `set.user_id`, excluding handles it already owns
    pub fn begin_registration(
        &self,
        set: &UserCredentialSet,
    ) -> Result<(CreationChallengeResponse, ChallengeState), CeremonyError> {
        let excluded = set.handles();
        let exclude_ids: Vec<CredentialID> = excluded
            .iter()
            .map(|handle| CredentialID::from(handle.as_bytes().to_vec()))
            .collect();

        let (ccr, registration) = self
            .relying_party
            .webauthn()
            .start_passkey_registration(
                set.user_id,
                &set.username,
                &set.display_name,
                (!exclude_ids.is_empty()).then_some(exclude_ids),
            )
            .map_err(|e| CeremonyError::RelyingParty(format!("{e:?}")))?;

        let state = ChallengeState::new(
            to_bytes(&ccr.public_key.challenge),
            set.user_id,
            excluded,
            ccr.public_key.timeout,
            VerifierState::Registration(registration),
        );

        Ok((ccr, state))
    }

    /// Verify an attestation against the consumed registration state
    pub fn finish_registration(
        &self,
        set: &UserCredentialSet,
        state: ChallengeState,
        response: &RegisterPublicKeyCredential,
    ) -> Result<VerifiedCredential, CeremonyError> {
        let found = state.kind();
        let VerifierState::Registration(registration) = state.verifier else {
            return Err(CeremonyError::WrongCeremony {
                expected: CeremonyKind::Registration,
                found,
            });
        };

        if state.user_id != set.user_id {
            return Err(CeremonyError::UserMismatch);
        }

        let response_handle = CredentialHandle::new(to_bytes(&response.raw_id));
        if state.credential_handles.contains(&response_handle) {
            return Err(CeremonyError::DuplicateCredentialHandle);
        }

        let passkey = self
            .relying_party
            .webauthn()
            .finish_passkey_registration(response, &registration)
            .map_err(|e| self.map_verifier_error(e, CeremonyKind::Registration))?;

        let attested = parse_attestation_object(&to_bytes(&response.response.attestation_object))?;
        let handle = CredentialHandle::new(to_bytes(passkey.cred_id()));
        if attested.handle != handle {
            return Err(CeremonyError::AttestationInvalid(
                "credential id differs from attested credential data".to_string(),
            ));
        }

        let encoded =
            serde_json::to_vec(&passkey).map_err(|e| CeremonyError::KeyMaterial(e.to_string()))?;

        Ok(VerifiedCredential {
            user_id: set.user_id,
            handle,
            key: KeyMaterial {
                algorithm: attested.algorithm,
                encoded,
            },
            aaguid: attested.aaguid,
            sign_count: attested.sign_count,
        })
    }

    /// Start a login offering every credential in the projection
    pub fn begin_login(
        &self,
        set: &UserCredentialSet,
    ) -> Result<(RequestChallengeResponse, ChallengeState), CeremonyError> {
        let (mut rcr, authentication) = self
            .relying_party
            .webauthn()
            .start_discoverable_authentication()
            .map_err(|e| CeremonyError::RelyingParty(format!("{e:?}")))?;

        let allowed = set.handles();
        rcr.public_key.allow_credentials = allowed
            .iter()
            .map(|handle| AllowCredentials {
                type_: "public-key".to_string(),
                id: handle.as_bytes().to_vec().into(),
                transports: None,
            })
            .collect();
        rcr.mediation = None;

        let state = ChallengeState::new(
            to_bytes(&rcr.public_key.challenge),
            set.user_id,
            allowed,
            rcr.public_key.timeout,
            VerifierState::Login(authentication),
        );

        Ok((rcr, state))
    }

    /// Verify an assertion against the consumed login state and apply the
    /// counter policy
    pub fn finish_login(
        &self,
        set: &UserCredentialSet,
        state: ChallengeState,
        response: &PublicKeyCredential,
    ) -> Result<LoginVerified, CeremonyError> {
        let found = state.kind();
        let VerifierState::Login(authentication) = state.verifier else {
            return Err(CeremonyError::WrongCeremony {
                expected: CeremonyKind::Login,
                found,
            });
        };

        if state.user_id != set.user_id {
            return Err(CeremonyError::UserMismatch);
        }

        let handle = CredentialHandle::new(to_bytes(&response.raw_id));
        if !state.credential_handles.contains(&handle) {
            return Err(CeremonyError::CredentialNotAllowed);
        }

        let credential = set.find(&handle).ok_or(CeremonyError::UnknownCredential)?;

        let passkey: Passkey = serde_json::from_slice(&credential.key.encoded)
            .map_err(|e| CeremonyError::KeyMaterial(e.to_string()))?;

        // Counter regression is judged below against the stored value, not by the verifier.
        let mut internal = VerifierCredential::from(passkey);
        internal.counter = 0;
        let passkey = Passkey::from(internal);

        let result = self
            .relying_party
            .webauthn()
            .finish_discoverable_authentication(
                response,
                authentication,
                &[DiscoverableKey::from(&passkey)],
            )
            .map_err(|e| self.map_verifier_error(e, CeremonyKind::Login))?;

        let reported = result.counter();
        let regressed = counter_regressed(credential.sign_count, reported);

        if regressed {
            tracing::warn!(
                user_id = %set.user_id,
                credential = %handle,
                stored = credential.sign_count,
                reported,
                policy = self.counter_policy.as_str(),
                "Signature counter regression, possible cloned authenticator"
            );

            if self.counter_policy == CounterPolicy::Reject {
                return Err(CeremonyError::CounterRegression {
                    handle,
                    stored: credential.sign_count,
                    reported,
                });
            }
        }

        Ok(LoginVerified {
            user_id: set.user_id,
            handle,
            counter: reported,
        })
    }

    fn map_verifier_error(&self, error: WebauthnError, ceremony: CeremonyKind) -> CeremonyError {
        match error {
            WebauthnError::MismatchedChallenge => CeremonyError::ChallengeMismatch,
            WebauthnError::InvalidRPOrigin => CeremonyError::OriginMismatch(format!(
                "expected {}",
                self.relying_party.origin()
            )),
            other => match ceremony {
                CeremonyKind::Registration => CeremonyError::AttestationInvalid(format!("{other:?}")),
                CeremonyKind::Login => CeremonyError::AssertionInvalid(format!("{other:?}")),
            },
        }
    }
}
