//! Session acquisition for anonymous users.
//!
//! `AnonymousSessionManager` hands out a cached session while it is valid,
//! otherwise it logs in the user whose credentials sit in the credential
//! store, creating a fresh anonymous user first when there are none. Callers
//! that arrive while a login is running join that login instead of starting
//! another one.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::api::{ApiError, IdentityProvider};

use super::{AuthError, CredentialStore, Session, UserCredentials};

type SessionResult = Result<Session, AuthError>;

/// One acquisition's outcome, awaitable by any number of callers.
type PendingSession = Shared<BoxFuture<'static, SessionResult>>;

/// Something that can hand out sessions for authorizing API calls.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// A valid session, reusing the cached one when possible.
    async fn get_session(&self) -> SessionResult;

    /// Log in again regardless of the cached session.
    async fn login_user(&self) -> SessionResult;
}

/// Returns true iff the part of the username after the first `@` is exactly
/// `email_domain`.
pub fn has_credentials_email_domain(email_domain: &str, credentials: &UserCredentials) -> bool {
    credentials.email_domain() == Some(email_domain)
}

struct Acquisition {
    id: u64,
    pending: PendingSession,
}

#[derive(Default)]
struct SessionState {
    current_session: Option<Session>,
    current_acquisition: Option<Acquisition>,
    next_acquisition_id: u64,
}

struct Inner {
    email_domain: String,
    identity_provider: Arc<dyn IdentityProvider>,
    credential_store: Arc<dyn CredentialStore>,
    state: Mutex<SessionState>,
}

/// Session manager backed by automatically provisioned anonymous users.
///
/// Cloning is cheap and clones share the cached session. Acquisitions are
/// spawned on the Tokio runtime, so the manager must be used from within one.
#[derive(Clone)]
pub struct AnonymousSessionManager {
    inner: Arc<Inner>,
}

#[derive(Default)]
pub struct AnonymousSessionManagerBuilder {
    email_domain: Option<String>,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
}

impl AnonymousSessionManagerBuilder {
    pub fn email_domain(mut self, email_domain: impl Into<String>) -> Self {
        self.email_domain = Some(email_domain.into());
        self
    }

    pub fn identity_provider(mut self, identity_provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(identity_provider);
        self
    }

    pub fn credential_store(mut self, credential_store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(credential_store);
        self
    }

    pub fn build(self) -> Result<AnonymousSessionManager, AuthError> {
        let email_domain = self
            .email_domain
            .filter(|domain| !domain.trim().is_empty())
            .ok_or_else(|| AuthError::missing_dependency("email domain"))?;
        let identity_provider = self
            .identity_provider
            .ok_or_else(|| AuthError::missing_dependency("identity provider"))?;
        let credential_store = self
            .credential_store
            .ok_or_else(|| AuthError::missing_dependency("credential store"))?;

        Ok(AnonymousSessionManager {
            inner: Arc::new(Inner {
                email_domain,
                identity_provider,
                credential_store,
                state: Mutex::new(SessionState::default()),
            }),
        })
    }
}

impl AnonymousSessionManager {
    pub fn builder() -> AnonymousSessionManagerBuilder {
        AnonymousSessionManagerBuilder::default()
    }

    pub fn new(
        email_domain: impl Into<String>,
        identity_provider: Arc<dyn IdentityProvider>,
        credential_store: Arc<dyn CredentialStore>,
    ) -> Result<Self, AuthError> {
        Self::builder()
            .email_domain(email_domain)
            .identity_provider(identity_provider)
            .credential_store(credential_store)
            .build()
    }

    pub fn email_domain(&self) -> &str {
        &self.inner.email_domain
    }

    /// The cached session, expired or not. Never triggers a login.
    pub fn current_session(&self) -> Option<Session> {
        self.inner.lock_state().current_session.clone()
    }

    /// Drop the cached session so the next `get_session` logs in again.
    pub fn invalidate_session(&self) {
        if self.inner.lock_state().current_session.take().is_some() {
            debug!("Cached session invalidated");
        }
    }

    async fn acquire(&self, reuse_cached: bool) -> SessionResult {
        let pending = {
            let mut guard = self.inner.lock_state();
            let state = &mut *guard;

            if reuse_cached {
                if let Some(session) = state.current_session.as_ref().filter(|s| !s.has_expired()) {
                    debug!("Reusing cached session");
                    return Ok(session.clone());
                }
            }

            match state.current_acquisition {
                Some(ref acquisition) => {
                    debug!(acquisition = acquisition.id, "Joining in-flight session acquisition");
                    acquisition.pending.clone()
                }
                None => {
                    let id = state.next_acquisition_id;
                    state.next_acquisition_id += 1;
                    debug!(acquisition = id, "Starting session acquisition");

                    let pending = Inner::spawn_acquisition(&self.inner, id);
                    state.current_acquisition = Some(Acquisition {
                        id,
                        pending: pending.clone(),
                    });
                    pending
                }
            }
        };

        pending.await
    }
}

#[async_trait]
impl SessionManager for AnonymousSessionManager {
    async fn get_session(&self) -> SessionResult {
        self.acquire(true).await
    }

    /// Joins an acquisition that is already running rather than starting a
    /// second one.
    async fn login_user(&self) -> SessionResult {
        self.acquire(false).await
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the login flow on its own task. The task settles the manager state
    /// itself, so the outcome is cached even if every caller stopped waiting.
    fn spawn_acquisition(inner: &Arc<Inner>, id: u64) -> PendingSession {
        let flow = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(flow.run_login_flow())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(AuthError::Internal("login flow panicked".to_string())));
            flow.settle(id, &result);
            result
        });

        // The task only fails to report back when the runtime cancels it.
        let inner = Arc::clone(inner);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    let err = if e.is_cancelled() {
                        AuthError::Cancelled
                    } else {
                        AuthError::Internal(e.to_string())
                    };
                    inner.settle(id, &Err(err.clone()));
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn settle(&self, id: u64, result: &SessionResult) {
        let mut state = self.lock_state();
        match result {
            Ok(session) => {
                state.current_session = Some(session.clone());
                debug!(acquisition = id, expires = %session.expiry_time(), "Session acquired");
            }
            Err(AuthError::Cancelled) => debug!(acquisition = id, "Session acquisition cancelled"),
            Err(e) => warn!(acquisition = id, error = %e, "Session acquisition failed"),
        }
        if state.current_acquisition.as_ref().is_some_and(|a| a.id == id) {
            state.current_acquisition = None;
        }
    }

    async fn run_login_flow(&self) -> SessionResult {
        match self.credential_store.get_user_credentials()? {
            Some(credentials) if !has_credentials_email_domain(&self.email_domain, &credentials) => {
                self.migrate_email_domain(credentials).await
            }
            Some(credentials) => self.login_with_recovery(&credentials).await,
            None => {
                let credentials = self.create_user().await?;
                self.login_with_recovery(&credentials).await
            }
        }
    }

    async fn login_with_recovery(&self, credentials: &UserCredentials) -> SessionResult {
        match self.identity_provider.login_user(credentials).await {
            Ok(session) => Ok(session),
            Err(ApiError::InvalidGrant) => self.recreate_user_and_login().await,
            Err(e) => Err(e.into()),
        }
    }

    /// Replace rejected credentials with a new user. Errors from here on are
    /// returned as-is; there is no second recovery.
    async fn recreate_user_and_login(&self) -> SessionResult {
        warn!("Stored credentials were rejected, creating a new anonymous user");
        self.credential_store.delete_user_credentials()?;
        let credentials = self.create_user().await?;
        Ok(self.identity_provider.login_user(&credentials).await?)
    }

    async fn create_user(&self) -> Result<UserCredentials, AuthError> {
        let credentials = UserCredentials::generate(&self.email_domain);
        let user = self.identity_provider.create_user(&credentials).await?;
        info!(user_id = %user.user_id, "Created anonymous user");
        self.credential_store.store_user_credentials(&credentials)?;
        Ok(credentials)
    }

    /// Move an existing account to the configured email domain so it keeps its
    /// identity-service account across the reconfiguration.
    async fn migrate_email_domain(&self, old: UserCredentials) -> SessionResult {
        info!(
            old_domain = old.email_domain().unwrap_or_default(),
            new_domain = %self.email_domain,
            "Email domain changed, migrating anonymous user"
        );

        let session = match self.identity_provider.login_user(&old).await {
            Ok(session) => session,
            Err(ApiError::InvalidGrant) => return self.recreate_user_and_login().await,
            Err(e) => return Err(e.into()),
        };

        let migrated = old.with_email_domain(&self.email_domain);
        self.identity_provider
            .update_email(&old.username, &migrated.username, &session)
            .await?;
        self.credential_store.delete_user_credentials()?;
        self.credential_store.store_user_credentials(&migrated)?;

        self.login_with_recovery(&migrated).await
    }
}

// ============================================================================
// Tests
// ============================================================================
