//! WebAuthn storage module
//!
//! Provides storage for:
//! - **Credentials**: registered authenticators, unique per handle and per
//!   (user, description).
//! - **Challenge state**: one opaque blob per browser session, consumed at most once.
//! - **Users**: read-only lookups by username and id.
//!
//! If `DATABASE_URL` is not set, falls back to in-memory storage
//! (useful for development and tests, but everything is lost on restart).

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::db::UserAccount;

use super::types::{Credential, CredentialHandle, NewCredential};

pub use super::types::CounterUpdate;

/// Which uniqueness rule a rejected insert violated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The user already has a credential with this description
    Description,
    /// The credential handle is already registered
    CredentialHandle,
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Uniqueness conflict: {0:?}")]
    Conflict(ConflictKind),

    #[error("Record not found")]
    NotFound,
}

/// Storage backend
enum Backend {
    /// PostgreSQL storage (production)
    Postgres(PostgresStore),
    /// In-memory storage (development fallback)
    Memory(MemoryStore),
}

/// Unified WebAuthn storage for credentials, challenge state, and users
pub struct WebAuthnStorage {
    backend: Backend,
}

impl WebAuthnStorage {
    /// Create storage with PostgreSQL backend
    pub async fn with_postgres(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, StorageError> {
        let pg_store = PostgresStore::new(database_url, max_connections, min_connections).await?;
        pg_store.migrate().await?;

        Ok(Self {
            backend: Backend::Postgres(pg_store),
        })
    }

    /// Create storage with in-memory backend (development only)
    pub fn in_memory() -> Self {
        tracing::warn!("Using in-memory storage - credentials will be lost on restart!");
        Self::memory(MemoryStore::new())
    }

    /// Wrap a prepared memory store, e.g. one seeded with users
    pub fn memory(store: MemoryStore) -> Self {
        Self {
            backend: Backend::Memory(store),
        }
    }

    /// Create storage from configuration
    ///
    /// Uses PostgreSQL if a database URL is configured, otherwise falls back to in-memory.
    pub async fn from_config(config: &Config) -> Result<Self, StorageError> {
        match config.database_url.as_deref() {
            Some(url) => {
                tracing::info!("Using PostgreSQL storage");
                Self::with_postgres(
                    url,
                    config.database_max_connections,
                    config.database_min_connections,
                )
                .await
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory storage");
                Ok(Self::in_memory())
            }
        }
    }

    /// Check if using persistent storage
    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, Backend::Postgres(_))
    }

    /// Check database health (always Ok for memory backend)
    pub async fn check_health(&self) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.check_health().await,
            Backend::Memory(_) => Ok(()),
        }
    }

    /// Run embedded migrations again (no-op for memory backend)
    pub async fn migrate(&self) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.migrate().await,
            Backend::Memory(_) => Ok(()),
        }
    }

    // ==================== Credential Methods ====================

    /// All credentials of a user, ordered by description
    pub async fn list_credentials(&self, user_id: Uuid) -> Result<Vec<Credential>, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.list_credentials(user_id).await,
            Backend::Memory(mem) => Ok(mem.list_credentials(user_id).await),
        }
    }

    /// Whether the user already has a credential with this description (case-insensitive)
    pub async fn credential_exists(
        &self,
        user_id: Uuid,
        description: &str,
    ) -> Result<bool, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.credential_exists(user_id, description).await,
            Backend::Memory(mem) => Ok(mem.credential_exists(user_id, description).await),
        }
    }

    /// Insert a credential, enforcing both uniqueness rules atomically
    pub async fn create_credential(
        &self,
        credential: NewCredential,
    ) -> Result<Credential, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.create_credential(credential).await,
            Backend::Memory(mem) => mem.create_credential(credential).await,
        }
    }

    /// Delete a credential owned by `user_id`
    pub async fn remove_credential(&self, user_id: Uuid, id: Uuid) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.remove_credential(user_id, id).await,
            Backend::Memory(mem) => mem.remove_credential(user_id, id).await,
        }
    }

    /// Record a successful use of a credential
    pub async fn touch_last_used(
        &self,
        user_id: Uuid,
        handle: &CredentialHandle,
    ) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.touch_last_used(user_id, handle).await,
            Backend::Memory(mem) => mem.touch_last_used(user_id, handle).await,
        }
    }

    /// Apply a reported signature counter in one atomic step
    pub async fn update_counter(
        &self,
        handle: &CredentialHandle,
        reported: u32,
    ) -> Result<CounterUpdate, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.update_counter(handle, reported).await,
            Backend::Memory(mem) => mem.update_counter(handle, reported).await,
        }
    }

    /// Credentials that have shown a counter regression, across all users
    pub async fn flagged_credentials(&self) -> Result<Vec<Credential>, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.flagged_credentials().await,
            Backend::Memory(mem) => Ok(mem.flagged_credentials().await),
        }
    }

    // ==================== Session State Methods ====================

    /// Store the ceremony state of a session, replacing any previous one
    pub async fn put_state(&self, session_id: &str, state: String) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.put_state(session_id, &state).await,
            Backend::Memory(mem) => {
                mem.put_state(session_id, state);
                Ok(())
            }
        }
    }

    /// Remove and return the ceremony state of a session with its write time
    pub async fn take_state(
        &self,
        session_id: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.take_state(session_id).await,
            Backend::Memory(mem) => Ok(mem.take_state(session_id)),
        }
    }

    /// Delete states written before `cutoff`, returning how many were removed
    pub async fn purge_states(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.purge_states(cutoff).await,
            Backend::Memory(mem) => Ok(mem.purge_states(cutoff)),
        }
    }

    // ==================== User Methods ====================

    pub async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserAccount>, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.find_user_by_username(username).await,
            Backend::Memory(mem) => Ok(mem.find_user_by_username(username)),
        }
    }

    pub async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.find_user_by_id(id).await,
            Backend::Memory(mem) => Ok(mem.find_user_by_id(id)),
        }
    }

    // ==================== Maintenance ====================

    /// Get storage statistics
    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let (credentials, pending_states) = match &self.backend {
            Backend::Postgres(pg) => (pg.credential_count().await?, pg.state_count().await?),
            Backend::Memory(mem) => (mem.credential_count().await, mem.state_count()),
        };

        Ok(StorageStats {
            credentials,
            pending_states,
            persistent: self.is_persistent(),
        })
    }
}

/// Storage statistics for monitoring
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub credentials: usize,
    pub pending_states: usize,
    pub persistent: bool,
}

impl std::fmt::Debug for WebAuthnStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            Backend::Postgres(_) => "PostgreSQL",
            Backend::Memory(_) => "Memory",
        };
        f.debug_struct("WebAuthnStorage")
            .field("backend", &backend)
            .finish()
    }
}
