//! Error types for the CRM core
//!
//! Errors are classified by recoverability:
//! - Retryable: network issues, transient backend failures
//! - NonRetryable: validation failures, missing records, bad configuration
//! - RequiresUserAction: expired or missing session

use thiserror::Error;

use crate::remote::RemoteError;

/// Error type for every core operation
#[derive(Debug, Error)]
pub enum CrmError {
    // Requires user action
    #[error("Auth expired, please re-authenticate")]
    AuthExpired,

    #[error("Not signed in")]
    NotSignedIn,

    // Retryable or not, depending on the remote failure
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    // Non-retryable errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl CrmError {
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        CrmError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, CrmError::AuthExpired)
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            CrmError::Remote(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error requires user action to resolve
    pub fn requires_user_action(&self) -> bool {
        matches!(self, CrmError::AuthExpired | CrmError::NotSignedIn)
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            CrmError::AuthExpired => "Your session expired. Sign in again to continue.",
            CrmError::NotSignedIn => "Sign in to continue.",
            CrmError::Remote(err) if err.is_transient() => {
                "Check your internet connection and try again."
            }
            CrmError::Remote(_) => "The change was not saved. Reload and try again.",
            CrmError::Validation(_) => "Fix the highlighted fields and submit again.",
            CrmError::NotFound { .. } => "The record no longer exists. Reload the list.",
            CrmError::Config(_) => "Check your configuration in ~/.medrep/config.json",
            CrmError::Io(_) => "Check file permissions and disk space.",
        }
    }
}

impl From<RemoteError> for CrmError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::AuthExpired => CrmError::AuthExpired,
            other => CrmError::Remote(other),
        }
    }
}

impl From<std::io::Error> for CrmError {
    fn from(err: std::io::Error) -> Self {
        CrmError::Io(err.to_string())
    }
}

/// Serializable error representation handed to the UI layer
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&CrmError> for CommandError {
    fn from(err: &CrmError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        CommandError {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
