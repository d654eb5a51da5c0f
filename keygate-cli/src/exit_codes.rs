//! Exit codes following sysexits.h conventions.
//!
//! These codes provide semantic meaning for different failure modes,
//! enabling scripts and cron jobs to handle errors appropriately.

use keygate_core::{ConfigError, StorageError};

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// General error (catch-all).
pub const GENERAL_ERROR: i32 = 1;

/// Data format error (stored record cannot be decoded).
/// Maps to EX_DATAERR from sysexits.h.
pub const DATA_ERROR: i32 = 65;

/// Requested record does not exist or is not owned by the given user.
/// Maps to EX_NOINPUT from sysexits.h.
pub const NOT_FOUND: i32 = 66;

/// Database unreachable.
/// Maps to EX_UNAVAILABLE from sysexits.h.
pub const UNAVAILABLE: i32 = 69;

/// Configuration missing or invalid (e.g. `DATABASE_URL` unset).
/// Maps to EX_CONFIG from sysexits.h.
pub const CONFIG_ERROR: i32 = 78;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub const fn success() -> Self {
        Self {
            code: SUCCESS,
            message: None,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");

        // Classify by the typed cause first, then by the context chain
        let code = if err.chain().any(|cause| cause.is::<ConfigError>()) {
            CONFIG_ERROR
        } else if let Some(storage) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<StorageError>())
        {
            match storage {
                StorageError::NotFound => NOT_FOUND,
                StorageError::Connection(_) | StorageError::Migration(_) => UNAVAILABLE,
                StorageError::Serialization(_) => DATA_ERROR,
                StorageError::Query(_) | StorageError::Conflict(_) => GENERAL_ERROR,
            }
        } else if message.contains("DATABASE_URL") {
            CONFIG_ERROR
        } else {
            GENERAL_ERROR
        };

        Self {
            code,
            message: Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_success() {
        let exit = ExitCode::success();
        assert_eq!(exit.code, SUCCESS);
        assert!(exit.message.is_none());
    }

    #[test]
    fn test_missing_database_url_is_config_error() {
        let err = anyhow::anyhow!("DATABASE_URL is not set");
        assert_eq!(ExitCode::from_anyhow(&err).code, CONFIG_ERROR);
    }

    #[test]
    fn test_typed_causes() {
        let err = anyhow::Error::new(StorageError::NotFound).context("Failed to remove credential");
        assert_eq!(ExitCode::from_anyhow(&err).code, NOT_FOUND);

        let err = Err::<(), _>(StorageError::Connection("refused".to_string()))
            .context("Failed to connect")
            .unwrap_err();
        assert_eq!(ExitCode::from_anyhow(&err).code, UNAVAILABLE);

        let err = anyhow::Error::new(ConfigError::InvalidValue {
            name: "KEYGATE_COUNTER_POLICY",
            reason: "bad".to_string(),
        });
        assert_eq!(ExitCode::from_anyhow(&err).code, CONFIG_ERROR);
    }

    #[test]
    fn test_unclassified_is_general() {
        let err = anyhow::anyhow!("something else");
        let exit = ExitCode::from_anyhow(&err);
        assert_eq!(exit.code, GENERAL_ERROR);
        assert_eq!(exit.message.as_deref(), Some("something else"));
    }
}
