//! docflow core - session management for a document-processing API client.
//!
//! Anonymous users are provisioned on the identity service behind the
//! scenes; callers only ever ask the [`auth::AnonymousSessionManager`] for a
//! session and attach its access token to their requests.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiError, IdentityProvider, User, UserCenterClient};
pub use auth::{
    AnonymousSessionManager, AuthError, CredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, Session, SessionManager, UserCredentials,
};
pub use config::Config;
