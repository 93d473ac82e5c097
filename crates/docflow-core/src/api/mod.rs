//! Identity-service API client module.
//!
//! This module provides the `UserCenterClient` for creating anonymous users,
//! logging them in and migrating their email address, together with the
//! `IdentityProvider` trait the session manager is written against.
//!
//! Errors are classified into `ApiError`; a rejected password grant is
//! reported as `ApiError::InvalidGrant`.

pub mod error;
pub mod user_center;

pub use error::ApiError;
pub use user_center::{IdentityProvider, User, UserCenterClient};
