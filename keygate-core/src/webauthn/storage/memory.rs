//! In-memory storage for credentials, session state, and users
//!
//! Credentials live behind one mutex so both uniqueness checks and the insert
//! happen in a single critical section. Session state uses a `DashMap`, whose
//! `remove` is the atomic take.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::UserAccount;
use crate::webauthn::types::{counter_regressed, Credential, CredentialHandle, NewCredential};

use super::{ConflictKind, CounterUpdate, StorageError};

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryStore {
    credentials: Mutex<Vec<Credential>>,
    /// session_id -> (encoded state, written at)
    sessions: DashMap<String, (String, DateTime<Utc>)>,
    users: DashMap<Uuid, UserAccount>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user so ceremonies can resolve it
    pub fn add_user(&self, user: UserAccount) {
        self.users.insert(user.id, user);
    }

    pub async fn list_credentials(&self, user_id: Uuid) -> Vec<Credential> {
        let credentials = self.credentials.lock().await;
        let mut owned: Vec<Credential> = credentials
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.description.cmp(&b.description));
        owned
    }

    pub async fn credential_exists(&self, user_id: Uuid, description: &str) -> bool {
        let wanted = description.to_lowercase();
        self.credentials
            .lock()
            .await
            .iter()
            .any(|c| c.user_id == user_id && c.description.to_lowercase() == wanted)
    }

    pub async fn create_credential(
        &self,
        new: NewCredential,
    ) -> Result<Credential, StorageError> {
        let mut credentials = self.credentials.lock().await;

        if credentials.iter().any(|c| c.handle == new.handle) {
            return Err(StorageError::Conflict(ConflictKind::CredentialHandle));
        }

        let wanted = new.description.to_lowercase();
        if credentials
            .iter()
            .any(|c| c.user_id == new.user_id && c.description.to_lowercase() == wanted)
        {
            return Err(StorageError::Conflict(ConflictKind::Description));
        }

        let credential = Credential {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            handle: new.handle,
            key: new.key,
            aaguid: new.aaguid,
            sign_count: new.sign_count,
            clone_warning: false,
            description: new.description,
            created_at: Utc::now(),
            last_used_at: None,
        };
        credentials.push(credential.clone());

        Ok(credential)
    }

    pub async fn remove_credential(&self, user_id: Uuid, id: Uuid) -> Result<(), StorageError> {
        let mut credentials = self.credentials.lock().await;
        let position = credentials
            .iter()
            .position(|c| c.id == id && c.user_id == user_id)
            .ok_or(StorageError::NotFound)?;
        credentials.remove(position);
        Ok(())
    }

    pub async fn touch_last_used(
        &self,
        user_id: Uuid,
        handle: &CredentialHandle,
    ) -> Result<(), StorageError> {
        let mut credentials = self.credentials.lock().await;
        let credential = credentials
            .iter_mut()
            .find(|c| c.user_id == user_id && &c.handle == handle)
            .ok_or(StorageError::NotFound)?;
        credential.last_used_at = Some(Utc::now());
        Ok(())
    }

    pub async fn update_counter(
        &self,
        handle: &CredentialHandle,
        reported: u32,
    ) -> Result<CounterUpdate, StorageError> {
        let mut credentials = self.credentials.lock().await;
        let credential = credentials
            .iter_mut()
            .find(|c| &c.handle == handle)
            .ok_or(StorageError::NotFound)?;

        let regressed = counter_regressed(credential.sign_count, reported);
        credential.sign_count = credential.sign_count.max(reported);
        credential.clone_warning |= regressed;

        Ok(CounterUpdate {
            stored: credential.sign_count,
            clone_warning: credential.clone_warning,
            regressed,
        })
    }

    pub async fn flagged_credentials(&self) -> Vec<Credential> {
        self.credentials
            .lock()
            .await
            .iter()
            .filter(|c| c.clone_warning)
            .cloned()
            .collect()
    }

    pub async fn credential_count(&self) -> usize {
        self.credentials.lock().await.len()
    }

    pub fn put_state(&self, session_id: &str, state: String) {
        self.sessions
            .insert(session_id.to_string(), (state, Utc::now()));
    }

    pub fn take_state(&self, session_id: &str) -> Option<(String, DateTime<Utc>)> {
        self.sessions.remove(session_id).map(|(_, entry)| entry)
    }

    pub fn purge_states(&self, cutoff: DateTime<Utc>) -> u64 {
        let before = self.sessions.len();
        self.sessions.retain(|_, (_, written_at)| *written_at >= cutoff);
        before.saturating_sub(self.sessions.len()) as u64
    }

    pub fn state_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn find_user_by_username(&self, username: &str) -> Option<UserAccount> {
        let wanted = username.to_lowercase();
        self.users
            .iter()
            .find(|entry| entry.username.to_lowercase() == wanted)
            .map(|entry| entry.value().clone())
    }

    pub fn find_user_by_id(&self, id: Uuid) -> Option<UserAccount> {
        self.users.get(&id).map(|entry| entry.value().clone())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("sessions", &self.sessions.len())
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}
