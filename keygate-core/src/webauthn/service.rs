//! Passkey ceremony service
//!
//! The entry points an HTTP layer calls: each takes the caller's session id,
//! runs storage, session binding and the engine in the right order, and turns
//! every internal failure into a [`CeremonyFailure`].

use std::sync::Arc;

use uuid::Uuid;
use webauthn_rs::prelude::{
    CreationChallengeResponse, PublicKeyCredential, RegisterPublicKeyCredential,
    RequestChallengeResponse,
};

use crate::config::{Config, ConfigError, CounterPolicy};
use crate::error::{CeremonyError, CeremonyFailure};

use super::config::RelyingParty;
use super::dummy::DummyCredentialGenerator;
use super::engine::CeremonyEngine;
use super::session::SessionBinding;
use super::storage::{StorageError, WebAuthnStorage};
use super::types::{
    CeremonyKind, Credential, CredentialForm, LoginChallengeForm, LoginSuccess, LoginVerifyForm,
    NewCredential, UserCredentialSet,
};

/// Registration and login flows over shared storage
pub struct PasskeyService {
    engine: CeremonyEngine,
    storage: Arc<WebAuthnStorage>,
    dummies: DummyCredentialGenerator,
    challenge_ttl_secs: u64,
}

impl PasskeyService {
    pub fn new(
        engine: CeremonyEngine,
        storage: Arc<WebAuthnStorage>,
        dummies: DummyCredentialGenerator,
        challenge_ttl_secs: u64,
    ) -> Self {
        Self {
            engine,
            storage,
            dummies,
            challenge_ttl_secs,
        }
    }

    /// Build the relying party and storage described by `config`
    pub async fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let relying_party = RelyingParty::from_config(config)?;
        let storage = WebAuthnStorage::from_config(config).await?;

        tracing::info!(
            rp_id = %config.rp_id,
            origin = %relying_party.origin(),
            counter_policy = config.counter_policy.as_str(),
            persistent = storage.is_persistent(),
            "Passkey service initialised"
        );

        Ok(Self::new(
            CeremonyEngine::new(relying_party, config.counter_policy),
            Arc::new(storage),
            DummyCredentialGenerator::from_config(config)?,
            config.challenge_ttl_secs,
        ))
    }

    pub fn storage(&self) -> &Arc<WebAuthnStorage> {
        &self.storage
    }

    pub fn counter_policy(&self) -> CounterPolicy {
        self.engine.counter_policy()
    }

    fn binding<'a>(&'a self, session_id: &'a str) -> SessionBinding<'a> {
        SessionBinding::new(&self.storage, session_id, self.challenge_ttl_secs)
    }

    async fn user_set(&self, user_id: Uuid) -> Result<UserCredentialSet, CeremonyError> {
        let account = self
            .storage
            .find_user_by_id(user_id)
            .await?
            .ok_or(CeremonyError::UnknownUser)?;
        let credentials = self.storage.list_credentials(user_id).await?;
        Ok(UserCredentialSet::from_account(&account, credentials))
    }

    /// Resolve the projection a login runs against. Unknown users and users
    /// without credentials get the dummy credential for their username.
    async fn login_set(&self, username: &str) -> Result<UserCredentialSet, CeremonyError> {
        match self.storage.find_user_by_username(username).await? {
            Some(account) => {
                let credentials = self.storage.list_credentials(account.id).await?;
                let set = UserCredentialSet::from_account(&account, credentials);
                Ok(self.dummies.substitute(&set))
            }
            None => {
                // Same number of storage round trips as a known user.
                self.storage.list_credentials(Uuid::nil()).await?;
                Ok(self.dummies.credential_set_for(username))
            }
        }
    }

    // ==================== Registration ====================

    /// Begin registering a new passkey for a signed-in user
    pub async fn start_registration(
        &self,
        session_id: &str,
        user_id: Uuid,
    ) -> Result<CreationChallengeResponse, CeremonyFailure> {
        self.try_start_registration(session_id, user_id)
            .await
            .map_err(|e| e.into_failure(CeremonyKind::Registration, None))
    }

    async fn try_start_registration(
        &self,
        session_id: &str,
        user_id: Uuid,
    ) -> Result<CreationChallengeResponse, CeremonyError> {
        let set = self.user_set(user_id).await?;
        let (ccr, state) = self.engine.begin_registration(&set)?;
        self.binding(session_id).put(&state).await?;

        tracing::info!(
            session = %session_id,
            user_id = %user_id,
            excluded = state.credential_handles.len(),
            "Passkey registration started"
        );
        Ok(ccr)
    }

    /// Finish a registration and store the credential under its description
    pub async fn save_credential(
        &self,
        session_id: &str,
        user_id: Uuid,
        form: &CredentialForm,
    ) -> Result<Credential, CeremonyFailure> {
        self.try_save_credential(session_id, user_id, form)
            .await
            .map_err(|e| e.into_failure(CeremonyKind::Registration, None))
    }

    async fn try_save_credential(
        &self,
        session_id: &str,
        user_id: Uuid,
        form: &CredentialForm,
    ) -> Result<Credential, CeremonyError> {
        // The challenge is spent whatever happens next.
        let state = self.binding(session_id).take_and_clear().await?;

        form.validate()?;
        let description = form.description.trim();

        if self.storage.credential_exists(user_id, description).await? {
            return Err(CeremonyError::DescriptionTaken);
        }

        let response: RegisterPublicKeyCredential = serde_json::from_str(&form.public_key)
            .map_err(|e| CeremonyError::MalformedResponse(e.to_string()))?;

        let set = self.user_set(user_id).await?;
        let verified = self.engine.finish_registration(&set, state, &response)?;

        let credential = self
            .storage
            .create_credential(NewCredential::new(verified, description))
            .await?;

        tracing::info!(
            session = %session_id,
            user_id = %user_id,
            credential = %credential.handle,
            aaguid = %credential.aaguid,
            "Passkey registration completed"
        );
        Ok(credential)
    }

    // ==================== Login ====================

    /// Begin a login for a username, known or not
    pub async fn start_login(
        &self,
        session_id: &str,
        form: &LoginChallengeForm,
    ) -> Result<RequestChallengeResponse, CeremonyFailure> {
        self.try_start_login(session_id, form)
            .await
            .map_err(|e| e.into_failure(CeremonyKind::Login, None))
    }

    async fn try_start_login(
        &self,
        session_id: &str,
        form: &LoginChallengeForm,
    ) -> Result<RequestChallengeResponse, CeremonyError> {
        form.validate()?;
        let set = self.login_set(form.username.trim()).await?;
        self.issue_login(session_id, &set).await
    }

    async fn issue_login(
        &self,
        session_id: &str,
        set: &UserCredentialSet,
    ) -> Result<RequestChallengeResponse, CeremonyError> {
        let (rcr, state) = self.engine.begin_login(set)?;
        self.binding(session_id).put(&state).await?;

        tracing::info!(session = %session_id, "Passkey login started");
        Ok(rcr)
    }

    /// Verify a login assertion
    ///
    /// On failure the session already holds a fresh challenge for the same
    /// username and the options come back in [`CeremonyFailure::retry`].
    pub async fn verify_login(
        &self,
        session_id: &str,
        form: &LoginVerifyForm,
    ) -> Result<LoginSuccess, CeremonyFailure> {
        match self.try_verify_login(session_id, form).await {
            Ok(success) => Ok(success),
            Err(error) => {
                let retry = self.retry_options(session_id, form).await;
                Err(error.into_failure(CeremonyKind::Login, retry))
            }
        }
    }

    async fn try_verify_login(
        &self,
        session_id: &str,
        form: &LoginVerifyForm,
    ) -> Result<LoginSuccess, CeremonyError> {
        let state = self.binding(session_id).take_and_clear().await?;

        form.validate()?;
        let username = form.username.trim();

        let response: PublicKeyCredential = serde_json::from_str(&form.public_key_credential)
            .map_err(|e| CeremonyError::MalformedResponse(e.to_string()))?;

        let set = self.login_set(username).await?;

        let verified = match self.engine.finish_login(&set, state, &response) {
            Ok(verified) => verified,
            Err(CeremonyError::CounterRegression {
                handle,
                stored,
                reported,
            }) => {
                // Rejected, but the credential stays flagged.
                self.storage.update_counter(&handle, reported).await?;
                return Err(CeremonyError::CounterRegression {
                    handle,
                    stored,
                    reported,
                });
            }
            Err(error) => return Err(error),
        };

        let update = self
            .storage
            .update_counter(&verified.handle, verified.counter)
            .await?;
        self.storage
            .touch_last_used(verified.user_id, &verified.handle)
            .await?;

        if update.clone_warning {
            tracing::warn!(
                user_id = %verified.user_id,
                credential = %verified.handle,
                "Login with a credential flagged as possibly cloned"
            );
        }

        tracing::info!(
            session = %session_id,
            user_id = %verified.user_id,
            credential = %verified.handle,
            sign_count = update.stored,
            "Passkey login completed"
        );

        Ok(LoginSuccess {
            user_id: verified.user_id,
            username: set.username,
            handle: verified.handle,
            reported_counter: verified.counter,
            stored_counter: update.stored,
            clone_warning: update.clone_warning,
        })
    }

    async fn retry_options(
        &self,
        session_id: &str,
        form: &LoginVerifyForm,
    ) -> Option<RequestChallengeResponse> {
        let username = form.username.trim();
        if username.is_empty() {
            return None;
        }

        let reissued = match self.login_set(username).await {
            Ok(set) => self.issue_login(session_id, &set).await,
            Err(error) => Err(error),
        };

        match reissued {
            Ok(rcr) => Some(rcr),
            Err(error) => {
                tracing::error!(
                    session = %session_id,
                    error = %error,
                    "Could not re-issue login challenge"
                );
                None
            }
        }
    }

    // ==================== Credential Management ====================

    /// A user's credentials, ordered by description
    pub async fn credentials(&self, user_id: Uuid) -> Result<Vec<Credential>, StorageError> {
        self.storage.list_credentials(user_id).await
    }

    /// Remove a credential owned by `user_id`
    pub async fn remove_credential(&self, user_id: Uuid, id: Uuid) -> Result<(), StorageError> {
        self.storage.remove_credential(user_id, id).await?;
        tracing::info!(user_id = %user_id, credential_record = %id, "Passkey removed");
        Ok(())
    }
}

impl std::fmt::Debug for PasskeyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasskeyService")
            .field("engine", &self.engine)
            .field("storage", &self.storage)
            .field("challenge_ttl_secs", &self.challenge_ttl_secs)
            .finish_non_exhaustive()
    }
}
