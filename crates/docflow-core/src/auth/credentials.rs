use std::fmt;
use std::sync::{Mutex, PoisonError};

use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::AuthError;

/// Keychain account under which the single anonymous user is stored.
const ANONYMOUS_ACCOUNT: &str = "anonymous-user";

/// Username and password of an identity-service account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Fresh random credentials: `<uuid>@<email_domain>` with a random password.
    pub fn generate(email_domain: &str) -> Self {
        Self::new(
            format!("{}@{}", Uuid::new_v4(), email_domain),
            Uuid::new_v4().to_string(),
        )
    }

    /// Everything after the first `@` of the username.
    pub fn email_domain(&self) -> Option<&str> {
        self.username.split_once('@').map(|(_, domain)| domain)
    }

    /// Everything before the first `@` of the username (the whole username if
    /// there is no `@`).
    pub fn local_part(&self) -> &str {
        self.username
            .split_once('@')
            .map(|(local, _)| local)
            .unwrap_or(&self.username)
    }

    /// Same local part and password, moved to `email_domain`.
    pub fn with_email_domain(&self, email_domain: &str) -> Self {
        Self::new(format!("{}@{}", self.local_part(), email_domain), self.password.clone())
    }
}

/// Single-slot persistence for the anonymous user's credentials.
///
/// Implementations are expected to be local and fast; the session manager
/// calls them from async code without offloading.
pub trait CredentialStore: Send + Sync {
    fn get_user_credentials(&self) -> Result<Option<UserCredentials>, AuthError>;

    fn store_user_credentials(&self, credentials: &UserCredentials) -> Result<(), AuthError>;

    fn delete_user_credentials(&self) -> Result<(), AuthError>;
}

/// Credentials kept in the OS keychain, serialized as one JSON entry.
///
/// The keychain entry is created once and reused, so every operation addresses
/// the same credential.
pub struct KeyringCredentialStore {
    service: String,
    entry: Entry,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Result<Self, AuthError> {
        let service = service.into();
        let entry = Entry::new(&service, ANONYMOUS_ACCOUNT)?;
        Ok(Self { service, entry })
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get_user_credentials(&self) -> Result<Option<UserCredentials>, AuthError> {
        let secret = match self.entry.get_password() {
            Ok(secret) => secret,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let credentials = serde_json::from_str(&secret).map_err(|e| {
            AuthError::CredentialStore(format!("Stored credentials are unreadable: {}", e))
        })?;
        Ok(Some(credentials))
    }

    fn store_user_credentials(&self, credentials: &UserCredentials) -> Result<(), AuthError> {
        let secret = serde_json::to_string(credentials)
            .map_err(|e| AuthError::CredentialStore(e.to_string()))?;
        self.entry.set_password(&secret)?;
        debug!(service = %self.service, "Stored user credentials in keychain");
        Ok(())
    }

    fn delete_user_credentials(&self) -> Result<(), AuthError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<UserCredentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: UserCredentials) -> Self {
        Self {
            slot: Mutex::new(Some(credentials)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get_user_credentials(&self) -> Result<Option<UserCredentials>, AuthError> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn store_user_credentials(&self, credentials: &UserCredentials) -> Result<(), AuthError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(credentials.clone());
        Ok(())
    }

    fn delete_user_credentials(&self) -> Result<(), AuthError> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}
