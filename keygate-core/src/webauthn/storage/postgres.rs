//! PostgreSQL storage for credentials, session state, and users
//!
//! Uniqueness is enforced by the schema: `credentials_handle_key` on the
//! credential handle and `credentials_user_description_key` on
//! `(user_id, lower(description))`.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{UserAccount, UserRepository};
use crate::webauthn::types::{Credential, CredentialHandle, KeyMaterial, NewCredential};

use super::{ConflictKind, CounterUpdate, StorageError};

const HANDLE_CONSTRAINT: &str = "credentials_handle_key";

const CREDENTIAL_COLUMNS: &str = "id, user_id, credential_id, public_key, public_key_algorithm, \
     authenticator_aaguid, authenticator_sign_count, authenticator_clone_warning, \
     description, created_at, last_used_at";

/// PostgreSQL-backed storage
pub struct PostgresStore {
    pool: PgPool,
    users: UserRepository,
}

impl PostgresStore {
    /// Connect a pool with the given bounds
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        tracing::info!(max_connections, min_connections, "Connected to PostgreSQL database");
        Ok(Self::from_pool(pool))
    }

    /// Create from an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            pool,
        }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Check database connection health
    pub async fn check_health(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    pub async fn list_credentials(&self, user_id: Uuid) -> Result<Vec<Credential>, StorageError> {
        let rows = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE user_id = $1 ORDER BY description ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        rows.into_iter().map(CredentialRow::into_credential).collect()
    }

    pub async fn credential_exists(
        &self,
        user_id: Uuid,
        description: &str,
    ) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM credentials
                WHERE user_id = $1 AND LOWER(description) = LOWER($2)
            )
            "#,
        )
        .bind(user_id)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(exists)
    }

    pub async fn create_credential(
        &self,
        new: NewCredential,
    ) -> Result<Credential, StorageError> {
        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            r#"
            INSERT INTO credentials (
                id, user_id, credential_id, public_key, public_key_algorithm,
                authenticator_aaguid, authenticator_sign_count, description
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {CREDENTIAL_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.handle.as_bytes())
        .bind(&new.key.encoded)
        .bind(new.key.algorithm)
        .bind(new.aaguid)
        .bind(i64::from(new.sign_count))
        .bind(&new.description)
        .fetch_one(&self.pool)
        .await
        .map_err(map_insert_error)?;

        tracing::info!(
            user_id = %new.user_id,
            credential = %new.handle,
            "Credential stored in database"
        );
        row.into_credential()
    }

    pub async fn remove_credential(&self, user_id: Uuid, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    pub async fn touch_last_used(
        &self,
        user_id: Uuid,
        handle: &CredentialHandle,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET last_used_at = NOW()
            WHERE user_id = $1 AND credential_id = $2
            "#,
        )
        .bind(user_id)
        .bind(handle.as_bytes())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    /// Counter check and write in one statement; the row lock serialises
    /// concurrent logins on the same credential.
    pub async fn update_counter(
        &self,
        handle: &CredentialHandle,
        reported: u32,
    ) -> Result<CounterUpdate, StorageError> {
        let row: Option<(i64, bool, bool)> = sqlx::query_as(
            r#"
            WITH prior AS (
                SELECT id, authenticator_sign_count AS stored
                FROM credentials
                WHERE credential_id = $1
                FOR UPDATE
            )
            UPDATE credentials c
            SET authenticator_sign_count = GREATEST(prior.stored, $2),
                authenticator_clone_warning =
                    c.authenticator_clone_warning OR ($2 <> 0 AND $2 <= prior.stored)
            FROM prior
            WHERE c.id = prior.id
            RETURNING c.authenticator_sign_count,
                      c.authenticator_clone_warning,
                      ($2 <> 0 AND $2 <= prior.stored) AS regressed
            "#,
        )
        .bind(handle.as_bytes())
        .bind(i64::from(reported))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        let (stored, clone_warning, regressed) = row.ok_or(StorageError::NotFound)?;
        Ok(CounterUpdate {
            stored: sign_count_from_db(stored)?,
            clone_warning,
            regressed,
        })
    }

    pub async fn flagged_credentials(&self) -> Result<Vec<Credential>, StorageError> {
        let rows = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials \
             WHERE authenticator_clone_warning ORDER BY user_id, description"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        rows.into_iter().map(CredentialRow::into_credential).collect()
    }

    /// Get total credential count (for stats)
    pub async fn credential_count(&self) -> Result<usize, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM credentials")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(count as usize)
    }

    pub async fn put_state(&self, session_id: &str, state: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO webauthn_sessions (session_id, webauthn_state, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (session_id)
            DO UPDATE SET webauthn_state = EXCLUDED.webauthn_state, updated_at = NOW()
            "#,
        )
        .bind(session_id)
        .bind(state)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn take_state(
        &self,
        session_id: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, StorageError> {
        sqlx::query_as::<_, (String, DateTime<Utc>)>(
            r#"
            DELETE FROM webauthn_sessions
            WHERE session_id = $1
            RETURNING webauthn_state, updated_at
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))
    }

    pub async fn purge_states(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM webauthn_sessions WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    pub async fn state_count(&self) -> Result<usize, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webauthn_sessions")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(count as usize)
    }

    pub async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserAccount>, StorageError> {
        self.users
            .find_by_username(username)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))
    }

    pub async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, StorageError> {
        self.users
            .find_by_id(id)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))
    }
}

fn map_insert_error(error: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &error {
        if db.is_unique_violation() {
            let kind = if db.constraint() == Some(HANDLE_CONSTRAINT) {
                ConflictKind::CredentialHandle
            } else {
                ConflictKind::Description
            };
            return StorageError::Conflict(kind);
        }
    }
    StorageError::Query(error.to_string())
}

fn sign_count_from_db(value: i64) -> Result<u32, StorageError> {
    u32::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("sign count out of range: {value}")))
}

/// Database row for credentials
#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: Uuid,
    user_id: Uuid,
    credential_id: Vec<u8>,
    public_key: Vec<u8>,
    public_key_algorithm: i64,
    authenticator_aaguid: Uuid,
    authenticator_sign_count: i64,
    authenticator_clone_warning: bool,
    description: String,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl CredentialRow {
    fn into_credential(self) -> Result<Credential, StorageError> {
        Ok(Credential {
            id: self.id,
            user_id: self.user_id,
            handle: CredentialHandle::new(self.credential_id),
            key: KeyMaterial {
                algorithm: self.public_key_algorithm,
                encoded: self.public_key,
            },
            aaguid: self.authenticator_aaguid,
            sign_count: sign_count_from_db(self.authenticator_sign_count)?,
            clone_warning: self.authenticator_clone_warning,
            description: self.description,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
        })
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool", &"<PgPool>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_count_range_check() {
        assert_eq!(sign_count_from_db(42).unwrap(), 42);
        assert_eq!(sign_count_from_db(i64::from(u32::MAX)).unwrap(), u32::MAX);
        assert!(sign_count_from_db(-1).is_err());
        assert!(sign_count_from_db(i64::from(u32::MAX) + 1).is_err());
    }

    #[test]
    fn test_non_database_errors_map_to_query() {
        let err = map_insert_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, StorageError::Query(_)));
    }
}
