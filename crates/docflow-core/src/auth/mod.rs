//! Authentication module for managing anonymous user sessions.
//!
//! This module provides:
//! - `Session`: An access token with an expiry
//! - `UserCredentials` and `CredentialStore`: Single-slot credential storage,
//!   backed by the OS keychain or memory
//! - `AnonymousSessionManager`: Cached, coalesced session acquisition that
//!   provisions and repairs anonymous users on demand

pub mod credentials;
pub mod error;
pub mod manager;
pub mod session;

pub use credentials::{CredentialStore, KeyringCredentialStore, MemoryCredentialStore, UserCredentials};
pub use error::AuthError;
pub use manager::{
    has_credentials_email_domain, AnonymousSessionManager, AnonymousSessionManagerBuilder,
    SessionManager,
};
pub use session::Session;
