//! Ceremony error handling module
//!
//! Internal failure kinds carry full detail for logs. Callers only ever see
//! the small boundary vocabulary in [`ErrorCode`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use webauthn_rs_proto::RequestChallengeResponse;

use crate::webauthn::storage::{ConflictKind, StorageError};
use crate::webauthn::types::{CeremonyKind, CredentialHandle};

/// Internal ceremony failure with structured variants
#[derive(Debug, Error)]
pub enum CeremonyError {
    /// A required form field was empty
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// The authenticator response could not be parsed
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("No challenge state for this session, or it expired")]
    ChallengeExpiredOrMissing,

    #[error("Challenge state is for {found}, expected {expected}")]
    WrongCeremony {
        expected: CeremonyKind,
        found: CeremonyKind,
    },

    #[error("Challenge state was issued for a different user")]
    UserMismatch,

    #[error("Challenge state could not be decoded: {0}")]
    CorruptState(String),

    #[error("Signed challenge does not match the issued challenge")]
    ChallengeMismatch,

    #[error("Origin mismatch: {0}")]
    OriginMismatch(String),

    #[error("Attestation invalid: {0}")]
    AttestationInvalid(String),

    #[error("Assertion invalid: {0}")]
    AssertionInvalid(String),

    /// Registration response reuses a handle the user already owns
    #[error("Credential handle is already registered")]
    DuplicateCredentialHandle,

    /// Assertion made with a handle outside the offered allow list
    #[error("Credential was not offered in this challenge")]
    CredentialNotAllowed,

    #[error("Credential is not registered for this user")]
    UnknownCredential,

    #[error("User not found")]
    UnknownUser,

    /// Stored key material could not be decoded
    #[error("Key material unusable: {0}")]
    KeyMaterial(String),

    #[error("Signature counter regression on {handle}: stored {stored}, reported {reported}")]
    CounterRegression {
        handle: CredentialHandle,
        stored: u32,
        reported: u32,
    },

    #[error("Description already in use")]
    DescriptionTaken,

    #[error("Relying party error: {0}")]
    RelyingParty(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Coarse grouping of internal failures for logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    State,
    Crypto,
    Integrity,
    Storage,
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::State => "state",
            Self::Crypto => "crypto",
            Self::Integrity => "integrity",
            Self::Storage => "storage",
            Self::Configuration => "configuration",
        }
    }
}

/// Codes surfaced at the caller boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    FieldsMandatory,
    BadCredentials,
    CredentialAlreadyExists,
    CredentialCreationFailed,
    UnableToCreateCredential,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FieldsMandatory => "fields_mandatory",
            Self::BadCredentials => "bad_credentials",
            Self::CredentialAlreadyExists => "credential_already_exists",
            Self::CredentialCreationFailed => "credential_creation_failed",
            Self::UnableToCreateCredential => "unable_to_create_credential",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CeremonyError {
    /// Get the error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingField(_) | Self::MalformedResponse(_) | Self::DescriptionTaken => {
                ErrorCategory::Input
            }
            Self::ChallengeExpiredOrMissing
            | Self::WrongCeremony { .. }
            | Self::UserMismatch
            | Self::CorruptState(_) => ErrorCategory::State,
            Self::ChallengeMismatch
            | Self::OriginMismatch(_)
            | Self::AttestationInvalid(_)
            | Self::AssertionInvalid(_)
            | Self::KeyMaterial(_) => ErrorCategory::Crypto,
            Self::DuplicateCredentialHandle
            | Self::CredentialNotAllowed
            | Self::UnknownCredential
            | Self::UnknownUser
            | Self::CounterRegression { .. } => ErrorCategory::Integrity,
            Self::Storage(StorageError::Conflict(_)) => ErrorCategory::Input,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::RelyingParty(_) => ErrorCategory::Configuration,
        }
    }

    /// Collapse this failure to the boundary code for a ceremony
    pub fn code_for(&self, ceremony: CeremonyKind) -> ErrorCode {
        match (self, ceremony) {
            (Self::MissingField(_), _) => ErrorCode::FieldsMandatory,
            (Self::DescriptionTaken, CeremonyKind::Registration)
            | (
                Self::Storage(StorageError::Conflict(ConflictKind::Description)),
                CeremonyKind::Registration,
            ) => ErrorCode::CredentialAlreadyExists,
            (Self::Storage(_), CeremonyKind::Registration) => ErrorCode::UnableToCreateCredential,
            (_, CeremonyKind::Registration) => ErrorCode::CredentialCreationFailed,
            (_, CeremonyKind::Login) => ErrorCode::BadCredentials,
        }
    }

    /// Log the internal detail and translate to the boundary failure
    pub fn into_failure(
        self,
        ceremony: CeremonyKind,
        retry: Option<RequestChallengeResponse>,
    ) -> CeremonyFailure {
        let category = self.category();
        let code = self.code_for(ceremony);

        match category {
            ErrorCategory::Storage | ErrorCategory::Configuration => {
                tracing::error!(
                    ceremony = %ceremony,
                    category = category.as_str(),
                    code = code.as_str(),
                    error = %self,
                    "Ceremony failed"
                );
            }
            _ => {
                tracing::warn!(
                    ceremony = %ceremony,
                    category = category.as_str(),
                    code = code.as_str(),
                    error = %self,
                    "Ceremony failed"
                );
            }
        }

        CeremonyFailure { code, retry }
    }
}

/// What the caller sees when a ceremony fails
///
/// A failed login carries fresh options for the same username, already bound
/// to the session, so the browser can retry without another round trip.
#[derive(Debug, Error)]
#[error("{code}")]
pub struct CeremonyFailure {
    pub code: ErrorCode,
    pub retry: Option<RequestChallengeResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::CredentialAlreadyExists).unwrap(),
            "\"credential_already_exists\""
        );
        assert_eq!(ErrorCode::BadCredentials.to_string(), "bad_credentials");
    }

    #[test]
    fn test_login_failures_collapse_to_bad_credentials() {
        let errors = [
            CeremonyError::ChallengeExpiredOrMissing,
            CeremonyError::ChallengeMismatch,
            CeremonyError::CredentialNotAllowed,
            CeremonyError::UnknownUser,
            CeremonyError::KeyMaterial("bad".to_string()),
            CeremonyError::Storage(StorageError::NotFound),
            CeremonyError::CounterRegression {
                handle: CredentialHandle::from_slice(b"h"),
                stored: 5,
                reported: 5,
            },
        ];

        for error in errors {
            assert_eq!(error.code_for(CeremonyKind::Login), ErrorCode::BadCredentials);
        }
    }

    #[test]
    fn test_registration_code_mapping() {
        let kind = CeremonyKind::Registration;

        assert_eq!(
            CeremonyError::MissingField("description").code_for(kind),
            ErrorCode::FieldsMandatory
        );
        assert_eq!(
            CeremonyError::DescriptionTaken.code_for(kind),
            ErrorCode::CredentialAlreadyExists
        );
        assert_eq!(
            CeremonyError::Storage(StorageError::Conflict(ConflictKind::Description))
                .code_for(kind),
            ErrorCode::CredentialAlreadyExists
        );
        assert_eq!(
            CeremonyError::Storage(StorageError::Conflict(ConflictKind::CredentialHandle))
                .code_for(kind),
            ErrorCode::UnableToCreateCredential
        );
        assert_eq!(
            CeremonyError::Storage(StorageError::Query("down".to_string())).code_for(kind),
            ErrorCode::UnableToCreateCredential
        );
        assert_eq!(
            CeremonyError::DuplicateCredentialHandle.code_for(kind),
            ErrorCode::CredentialCreationFailed
        );
        assert_eq!(
            CeremonyError::OriginMismatch("https://evil.example".to_string()).code_for(kind),
            ErrorCode::CredentialCreationFailed
        );
    }

    #[test]
    fn test_categories() {
        assert_eq!(CeremonyError::UserMismatch.category(), ErrorCategory::State);
        assert_eq!(
            CeremonyError::AssertionInvalid("sig".to_string()).category(),
            ErrorCategory::Crypto
        );
        assert_eq!(
            CeremonyError::Storage(StorageError::Connection("refused".to_string())).category(),
            ErrorCategory::Storage
        );
        assert_eq!(
            CeremonyError::RelyingParty("build".to_string()).category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_failure_displays_code_only() {
        let failure = CeremonyError::AssertionInvalid("signature over wrong data".to_string())
            .into_failure(CeremonyKind::Login, None);
        assert_eq!(failure.to_string(), "bad_credentials");
        assert!(failure.retry.is_none());
    }
}
