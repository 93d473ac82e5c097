use thiserror::Error;

use crate::api::ApiError;

/// Errors surfaced by session acquisition.
///
/// `Clone` because one failed acquisition is handed to every caller that
/// joined it.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Api(ApiError),

    #[error("Credential store error: {0}")]
    CredentialStore(String),

    #[error("Session acquisition was cancelled")]
    Cancelled,

    #[error("Session acquisition failed unexpectedly: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn missing_dependency(name: &str) -> Self {
        AuthError::Configuration(format!("{} is required", name))
    }

    /// True when the identity service rejected the stored credentials.
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, AuthError::Api(ApiError::InvalidGrant))
    }

    /// The HTTP status behind a service error, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::Api(err) => err.status(),
            _ => None,
        }
    }
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Cancelled => AuthError::Cancelled,
            other => AuthError::Api(other),
        }
    }
}

impl From<keyring::Error> for AuthError {
    fn from(err: keyring::Error) -> Self {
        AuthError::CredentialStore(err.to_string())
    }
}
