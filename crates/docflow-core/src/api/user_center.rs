//! Client for the identity service ("user center").
//!
//! Anonymous users are created with a client token obtained through the
//! client-credentials grant and log in with the password grant. Both grants
//! go through `/oauth/token` with the app's client id and secret as HTTP
//! basic auth.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::{Session, UserCredentials};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
const GRANT_PASSWORD: &str = "password";

/// An account on the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub username: String,
}

/// The identity-service operations the session manager relies on.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create a user. Fails with a service error when the service rejects it.
    async fn create_user(&self, credentials: &UserCredentials) -> Result<User, ApiError>;

    /// Log a user in. Fails with `ApiError::InvalidGrant` when the credentials
    /// are no longer known to the service.
    async fn login_user(&self, credentials: &UserCredentials) -> Result<Session, ApiError>;

    /// Change the email (username) of the user that owns `session`.
    async fn update_email(
        &self,
        old_email: &str,
        new_email: &str,
        session: &Session,
    ) -> Result<(), ApiError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    expires_in: i64,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        Session::expiring_in(self.access_token, self.expires_in)
    }
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    /// The identity service reports the user's id here, not the email.
    user_name: String,
}

#[derive(Serialize)]
struct NewUser<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailUpdate<'a> {
    old_email: &'a str,
    email: &'a str,
}

/// HTTP implementation of [`IdentityProvider`].
/// Clone is cheap and clones share the cached client session.
#[derive(Clone)]
pub struct UserCenterClient {
    client: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    client_session: Arc<Mutex<Option<Session>>>,
}

impl UserCenterClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            client_session: Default::default(),
        })
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn request_token(&self, grant_type: &str, form: &[(&str, &str)]) -> Result<Session, ApiError> {
        let url = format!("{}/oauth/token", self.base_url);

        let response = self
            .client
            .post(&url)
            .query(&[("grant_type", grant_type)])
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse token response: {}", e)))?;

        if let Some(ref token_type) = token.token_type {
            if !token_type.eq_ignore_ascii_case("bearer") {
                warn!(token_type = %token_type, "Unexpected token type");
            }
        }
        Ok(token.into_session())
    }

    /// The app's own session, reused until it expires.
    ///
    /// The lock is held across the token request so concurrent callers wait
    /// for one client login instead of each starting their own.
    pub async fn client_session(&self) -> Result<Session, ApiError> {
        let mut cached = self.client_session.lock().await;
        if let Some(session) = cached.as_ref().filter(|s| !s.has_expired()) {
            return Ok(session.clone());
        }

        debug!("Requesting client session");
        let session = self.request_token(GRANT_CLIENT_CREDENTIALS, &[]).await?;
        *cached = Some(session.clone());
        Ok(session)
    }

    async fn forget_client_session(&self) {
        self.client_session.lock().await.take();
    }

    /// Resolve the user id behind a user session.
    async fn user_id(&self, session: &Session) -> Result<String, ApiError> {
        let url = format!("{}/oauth/check_token", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("token", session.access_token())])
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let info: TokenInfo = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse token info: {}", e)))?;
        Ok(info.user_name)
    }

    /// The user id is the last path segment of the new user's URL.
    fn user_id_from_location(location: &str) -> Option<&str> {
        location
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
    }

    /// A 401 on a client-authorized request means the cached client token went
    /// stale early; drop it so the next call requests a new one.
    async fn on_unauthorized_forget<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if matches!(result, Err(ApiError::Unauthorized)) {
            warn!("Client session was rejected, discarding it");
            self.forget_client_session().await;
        }
        result
    }

    async fn post_new_user(&self, credentials: &UserCredentials) -> Result<User, ApiError> {
        let client_session = self.client_session().await?;
        let url = format!("{}/api/users", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(client_session.access_token())
            .json(&NewUser {
                email: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        if response.status() != StatusCode::CREATED {
            debug!(status = %response.status(), "User creation returned a non-201 success");
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::InvalidResponse("User creation response has no Location header".to_string()))?;
        let user_id = Self::user_id_from_location(location)
            .ok_or_else(|| ApiError::InvalidResponse(format!("Invalid user location: {}", location)))?;

        Ok(User {
            user_id: user_id.to_string(),
            username: credentials.username.clone(),
        })
    }

    async fn put_email(&self, user_id: &str, old_email: &str, new_email: &str) -> Result<(), ApiError> {
        let client_session = self.client_session().await?;
        let url = format!("{}/api/users/{}", self.base_url, user_id);

        let response = self
            .client
            .put(&url)
            .bearer_auth(client_session.access_token())
            .json(&EmailUpdate {
                old_email,
                email: new_email,
            })
            .send()
            .await?;

        Self::check_response(response).await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for UserCenterClient {
    async fn create_user(&self, credentials: &UserCredentials) -> Result<User, ApiError> {
        let result = self.post_new_user(credentials).await;
        self.on_unauthorized_forget(result).await
    }

    async fn login_user(&self, credentials: &UserCredentials) -> Result<Session, ApiError> {
        self.request_token(
            GRANT_PASSWORD,
            &[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ],
        )
        .await
    }

    async fn update_email(
        &self,
        old_email: &str,
        new_email: &str,
        session: &Session,
    ) -> Result<(), ApiError> {
        let user_id = self.user_id(session).await?;
        debug!(user_id = %user_id, "Updating user email");
        let result = self.put_email(&user_id, old_email, new_email).await;
        self.on_unauthorized_forget(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use axum::extract::{Form, Path, Query, State};
    use axum::http::header::{AUTHORIZATION, LOCATION};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    #[test]
    fn test_parse_token_response() {
        let json = r#"{"token_type": "bearer", "access_token": "74c1e7fe-e464-451f-a6eb-8f0998c46ff6", "expires_in": 3599}"#;

        let token: TokenResponse = serde_json::from_str(json)
            .expect("Failed to parse token test JSON");
        assert_eq!(token.token_type.as_deref(), Some("bearer"));

        let session = token.into_session();
        assert_eq!(session.access_token(), "74c1e7fe-e464-451f-a6eb-8f0998c46ff6");
        assert!(!session.has_expired());
        assert!(session.minutes_until_expiry() >= 58);
    }

    #[test]
    fn test_parse_token_response_without_type() {
        let json = r#"{"access_token": "abc", "expires_in": 60}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(token.token_type.is_none());
    }

    #[test]
    fn test_parse_token_info() {
        let json = r#"{"user_name": "88a28076-18e8-4275-b39c-eaacc240d406", "client_id": "app", "scope": ["read"]}"#;
        let info: TokenInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.user_name, "88a28076-18e8-4275-b39c-eaacc240d406");
    }

    #[test]
    fn test_user_id_from_location() {
        assert_eq!(
            UserCenterClient::user_id_from_location(
                "https://user.example.net/api/users/88a28076-18e8-4275-b39c-eaacc240d406"
            ),
            Some("88a28076-18e8-4275-b39c-eaacc240d406")
        );
        assert_eq!(
            UserCenterClient::user_id_from_location("https://user.example.net/api/users/1234/"),
            Some("1234")
        );
        assert_eq!(UserCenterClient::user_id_from_location(""), None);
    }

    #[test]
    fn test_email_update_body_uses_camel_case() {
        let body = serde_json::to_value(EmailUpdate {
            old_email: "1234@example.com",
            email: "1234@beispiel.com",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"oldEmail": "1234@example.com", "email": "1234@beispiel.com"})
        );
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = UserCenterClient::new("https://user.example.net/", "id", "secret").unwrap();
        assert_eq!(client.base_url, "https://user.example.net");
    }

    // -------------------------------------------------------------------------
    // HTTP round trips against an in-process identity service
    // -------------------------------------------------------------------------

    const CLIENT_ID: &str = "app";
    const CLIENT_SECRET: &str = "secret";
    /// `app:secret`, base64 encoded.
    const CLIENT_BASIC_AUTH: &str = "Basic YXBwOnNlY3JldA==";
    const USER_EMAIL: &str = "foobar@example.com";
    const USER_PASSWORD: &str = "1234";
    const USER_TOKEN: &str = "user-token";
    const USER_ID: &str = "88a28076-18e8-4275-b39c-eaacc240d406";

    #[derive(Default)]
    struct FakeService {
        client_tokens_issued: AtomicUsize,
        reject_next_create: AtomicBool,
        created: StdMutex<Vec<(Value, String)>>,
        email_updates: StdMutex<Vec<(String, Value, String)>>,
    }

    fn header_value(headers: &HeaderMap, name: axum::http::HeaderName) -> String {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    fn token_json(token: &str) -> Response {
        Json(json!({"access_token": token, "token_type": "bearer", "expires_in": 3599})).into_response()
    }

    async fn issue_token(
        State(service): State<Arc<FakeService>>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        if header_value(&headers, AUTHORIZATION) != CLIENT_BASIC_AUTH {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let field = |key: &str| form.get(key).map(String::as_str);
        match query.get("grant_type").map(String::as_str) {
            Some("client_credentials") => {
                let n = service.client_tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
                token_json(&format!("client-{}", n))
            }
            Some("password") if field("username") == Some(USER_EMAIL) && field("password") == Some(USER_PASSWORD) => {
                token_json(USER_TOKEN)
            }
            Some("password") => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_grant", "error_description": "Bad credentials"})),
            )
                .into_response(),
            _ => StatusCode::BAD_REQUEST.into_response(),
        }
    }

    async fn post_user(
        State(service): State<Arc<FakeService>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        let auth = header_value(&headers, AUTHORIZATION);
        if !auth.starts_with("Bearer client-") || service.reject_next_create.swap(false, Ordering::SeqCst) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        service.created.lock().unwrap().push((body, auth));
        (StatusCode::CREATED, [(LOCATION, format!("/api/users/{}", USER_ID))]).into_response()
    }

    async fn check_token(Query(query): Query<HashMap<String, String>>) -> Response {
        if query.get("token").map(String::as_str) == Some(USER_TOKEN) {
            Json(json!({"user_name": USER_ID, "client_id": CLIENT_ID})).into_response()
        } else {
            (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_token"}))).into_response()
        }
    }

    async fn update_user(
        State(service): State<Arc<FakeService>>,
        Path(user_id): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let auth = header_value(&headers, AUTHORIZATION);
        service.email_updates.lock().unwrap().push((user_id, body, auth));
        StatusCode::NO_CONTENT
    }

    async fn spawn_service() -> (UserCenterClient, Arc<FakeService>) {
        let service = Arc::new(FakeService::default());
        let app = Router::new()
            .route("/oauth/token", post(issue_token))
            .route("/oauth/check_token", get(check_token))
            .route("/api/users", post(post_user))
            .route("/api/users/:id", put(update_user))
            .with_state(service.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = UserCenterClient::new(format!("http://{}/", addr), CLIENT_ID, CLIENT_SECRET).unwrap();
        (client, service)
    }

    #[tokio::test]
    async fn test_login_user_returns_session() {
        let (client, _service) = spawn_service().await;

        let session = client
            .login_user(&UserCredentials::new(USER_EMAIL, USER_PASSWORD))
            .await
            .unwrap();

        assert_eq!(session.access_token(), USER_TOKEN);
        assert!(!session.has_expired());
    }

    #[tokio::test]
    async fn test_login_with_unknown_credentials_is_invalid_grant() {
        let (client, _service) = spawn_service().await;

        let err = client
            .login_user(&UserCredentials::new(USER_EMAIL, "wrong"))
            .await
            .unwrap_err();

        assert_eq!(err, ApiError::InvalidGrant);
    }

    #[tokio::test]
    async fn test_wrong_client_secret_is_unauthorized() {
        let (client, _service) = spawn_service().await;
        let client = UserCenterClient {
            client_secret: "not-the-secret".to_string(),
            ..client
        };

        let err = client
            .login_user(&UserCredentials::new(USER_EMAIL, USER_PASSWORD))
            .await
            .unwrap_err();

        assert_eq!(err, ApiError::Unauthorized);
    }

    #[tokio::test]
    async fn test_create_user_reads_id_from_location() {
        let (client, service) = spawn_service().await;

        let user = client
            .create_user(&UserCredentials::new(USER_EMAIL, USER_PASSWORD))
            .await
            .unwrap();

        assert_eq!(user.user_id, USER_ID);
        assert_eq!(user.username, USER_EMAIL);

        let created = service.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, json!({"email": USER_EMAIL, "password": USER_PASSWORD}));
        assert_eq!(created[0].1, "Bearer client-1");
    }

    #[tokio::test]
    async fn test_client_session_is_reused_across_calls() {
        let (client, service) = spawn_service().await;

        client.create_user(&UserCredentials::generate("example.com")).await.unwrap();
        client.create_user(&UserCredentials::generate("example.com")).await.unwrap();

        assert_eq!(service.client_tokens_issued.load(Ordering::SeqCst), 1);
        assert_eq!(service.created.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_client_session_is_discarded() {
        let (client, service) = spawn_service().await;
        service.reject_next_create.store(true, Ordering::SeqCst);

        let err = client
            .create_user(&UserCredentials::generate("example.com"))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Unauthorized);
        assert_eq!(service.client_tokens_issued.load(Ordering::SeqCst), 1);

        // The next call fetches a new client token instead of reusing the rejected one
        client.create_user(&UserCredentials::generate("example.com")).await.unwrap();
        assert_eq!(service.client_tokens_issued.load(Ordering::SeqCst), 2);
        assert_eq!(service.created.lock().unwrap()[0].1, "Bearer client-2");
    }

    #[tokio::test]
    async fn test_update_email_puts_new_email_for_session_user() {
        let (client, service) = spawn_service().await;
        let session = client
            .login_user(&UserCredentials::new(USER_EMAIL, USER_PASSWORD))
            .await
            .unwrap();

        client
            .update_email(USER_EMAIL, "foobar@beispiel.com", &session)
            .await
            .unwrap();

        let updates = service.email_updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        let (user_id, body, auth) = &updates[0];
        assert_eq!(user_id, USER_ID);
        assert_eq!(body, &json!({"oldEmail": USER_EMAIL, "email": "foobar@beispiel.com"}));
        assert_eq!(auth, "Bearer client-1");
    }

    #[tokio::test]
    async fn test_update_email_with_unknown_session_fails() {
        let (client, service) = spawn_service().await;
        let session = Session::expiring_in("not-a-token", 3600);

        let err = client
            .update_email(USER_EMAIL, "foobar@beispiel.com", &session)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::UnexpectedStatus { status: 400, .. }));
        assert!(service.email_updates.lock().unwrap().is_empty());
    }
}
