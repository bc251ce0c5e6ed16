//! API client with session handling built into the transport.
//!
//! Every request goes through [`ApiClient::execute`], which runs the
//! request gate before sending (refresh if the access credential is about
//! to expire, then attach it) and the response recoverer after (one forced
//! refresh and resubmission on a 401, then give up and end the session).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::header::{self, HeaderValue};
use reqwest::{Client, Method, Request, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{
    ExpiryCause, HttpTokenExchange, LoginRedirect, RefreshCoordinator, RefreshSettings, Session,
    SessionListener, SessionStore, SessionTerminator, TerminationReason, TokenExchange,
};
use crate::config::Config;

use super::attempt::{EndpointKind, Endpoints, Recovery, RequestAttempt};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    token: String,
    refresh_token: String,
    role: Option<String>,
}

/// API client with managed session.
/// Clone is cheap - every clone shares the connection pool, the session
/// store, the refresh slot and the terminator.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    endpoints: Endpoints,
    store: Arc<dyn SessionStore>,
    coordinator: RefreshCoordinator,
    terminator: Arc<SessionTerminator>,
    /// First wait after a 429, doubled on each further one.
    rate_limit_backoff: Duration,
}

impl ApiClient {
    /// Create a client that refreshes against the configured token endpoint.
    pub fn new(
        config: &Config,
        store: Arc<dyn SessionStore>,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let refresh_client = Client::builder()
            .timeout(Duration::from_secs(config.refresh_timeout_secs))
            .build()?;
        let exchange = Arc::new(HttpTokenExchange::new(
            refresh_client,
            &config.api_base_url,
            &config.refresh_path,
        ));

        Ok(Self::with_exchange(client, config, store, listener, exchange))
    }

    /// Create a client around an existing HTTP client and token exchange.
    pub fn with_exchange(
        client: Client,
        config: &Config,
        store: Arc<dyn SessionStore>,
        listener: Arc<dyn SessionListener>,
        exchange: Arc<dyn TokenExchange>,
    ) -> Self {
        let coordinator =
            RefreshCoordinator::new(Arc::clone(&store), exchange, RefreshSettings::from(config));
        let terminator = Arc::new(SessionTerminator::new(
            Arc::clone(&store),
            listener,
            LoginRedirect::new(config.login_redirect.clone()),
        ));

        Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            endpoints: Endpoints {
                login_path: config.login_path.clone(),
                refresh_path: config.refresh_path.clone(),
            },
            store,
            coordinator,
            terminator,
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
        }
    }

    /// The current session, if any.
    pub fn session(&self) -> Result<Option<Session>, ApiError> {
        Ok(self.store.get()?)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.store.get(), Ok(Some(_)))
    }

    /// Authenticate and start a new session.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, ApiError> {
        let request = self
            .request(Method::POST, &self.endpoints.login_path)
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { username, password })
            .build()?;

        let response = self.execute(request).await?;
        let response = Self::check_response(response).await?;
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| {
                ApiError::InvalidResponse(format!("Failed to parse login response: {}", e))
            })?;

        let session = Session::new(login.token, login.refresh_token, login.role);
        self.store.set(&session)?;
        self.terminator.rearm();
        info!(username = username, role = ?session.role, "Logged in");
        Ok(session)
    }

    /// End the session at the user's request.
    pub fn logout(&self) {
        self.terminator.terminate(TerminationReason::LoggedOut);
    }

    /// Start building a request for a path under the API base URL.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Send a request through the request gate and the response recoverer.
    ///
    /// Non-401 responses, including other error statuses, are returned
    /// unchanged. `Err(ApiError::SessionExpired)` means the session has
    /// been terminated and the listener told to show the login page.
    pub async fn execute(&self, mut request: Request) -> Result<Response, ApiError> {
        let endpoint = self.endpoints.classify(request.url().path());
        let mut attempt = RequestAttempt::new();

        loop {
            // Keep an unauthenticated copy in case the server rejects the credential
            let replay = request.try_clone();
            let sent_with = self.gate(&mut request, endpoint).await?;

            debug!(method = %request.method(), url = %request.url(), ?attempt, "Sending request");
            let response = self.client.execute(request).await?;

            match attempt.on_response(response.status(), endpoint) {
                Recovery::PassThrough => return Ok(response),
                Recovery::Terminate => {
                    warn!(url = %response.url(), "Credential rejected again, ending session");
                    let cause = match endpoint {
                        EndpointKind::Refresh => ExpiryCause::RefreshRejected,
                        _ => ExpiryCause::CredentialRejected,
                    };
                    return Err(self.expire(cause));
                }
                Recovery::RefreshAndRetry => {
                    // Nothing was rejected if nothing was sent
                    let Some(rejected) = sent_with else {
                        return Ok(response);
                    };
                    let Some(next) = replay else {
                        warn!(url = %response.url(), "Streaming body cannot be resubmitted");
                        return Ok(response);
                    };

                    debug!(url = %response.url(), "Credential rejected, refreshing and retrying");
                    if let Err(e) = self.coordinator.force_refresh(&rejected).await {
                        return Err(self.expire(ExpiryCause::from(&e)));
                    }
                    request = next;
                }
            }
        }
    }

    /// Pre-flight hook: make sure the credential is fresh and attach it.
    /// Returns the credential sent, if any.
    async fn gate(
        &self,
        request: &mut Request,
        endpoint: EndpointKind,
    ) -> Result<Option<String>, ApiError> {
        if endpoint != EndpointKind::Protected {
            return Ok(None);
        }

        if let Err(e) = self.coordinator.ensure_fresh().await {
            return Err(self.expire(ExpiryCause::from(&e)));
        }

        let Some(session) = self.store.get()? else {
            return Ok(None);
        };
        let mut value = HeaderValue::from_str(&format!("Bearer {}", session.access_token))
            .map_err(|e| ApiError::InvalidRequest(format!("Unusable access credential: {}", e)))?;
        value.set_sensitive(true);
        request.headers_mut().insert(header::AUTHORIZATION, value);
        Ok(Some(session.access_token))
    }

    fn expire(&self, cause: ExpiryCause) -> ApiError {
        self.terminator.terminate(TerminationReason::SessionExpired(cause));
        ApiError::SessionExpired(cause)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            // Rate limited - signal to retry
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn send_with_backoff<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff = self.rate_limit_backoff;

        loop {
            let request = build().build()?;
            let url = request.url().to_string();
            let response = self.execute(request).await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    // Rate limited
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(
                        url = %url,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2; // Exponential backoff
                }
            }
        }
    }

    async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let url = response.url().to_string();
        response
            .json()
            .await
            .map_err(|e| {
                ApiError::InvalidResponse(format!(
                    "Failed to parse JSON response from {}: {}",
                    url, e
                ))
            })
    }

    // ===== JSON helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .send_with_backoff(|| self.request(Method::GET, path))
            .await?;
        Self::parse_json(response).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .send_with_backoff(|| self.request(Method::POST, path).json(body))
            .await?;
        Self::parse_json(response).await
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .send_with_backoff(|| self.request(Method::PUT, path).json(body))
            .await?;
        Self::parse_json(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send_with_backoff(|| self.request(Method::DELETE, path))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::tests::token_expiring_in;
    use crate::auth::{MemorySessionStore, RefreshError, TokenPair};
    use async_trait::async_trait;

    struct UnreachableExchange;

    #[async_trait]
    impl TokenExchange for UnreachableExchange {
        async fn exchange(&self, _refresh_token: &str) -> Result<TokenPair, RefreshError> {
            Err(RefreshError::NetworkFailure("offline".into()))
        }
    }

    fn client_with(store: Arc<MemorySessionStore>) -> ApiClient {
        let config = Config {
            api_base_url: "https://example.org/api/".to_string(),
            ..Config::default()
        };
        ApiClient::with_exchange(
            Client::new(),
            &config,
            store,
            Arc::new(|_: TerminationReason, _: &str| {}),
            Arc::new(UnreachableExchange),
        )
    }

    #[test]
    fn test_url() {
        let client = client_with(Arc::new(MemorySessionStore::new()));
        assert_eq!(client.url("/tasks"), "https://example.org/api/tasks");
        assert_eq!(client.url("https://other.org/x"), "https://other.org/x");
    }

    #[tokio::test]
    async fn test_gate_attaches_current_credential() {
        let access = token_expiring_in(3600);
        let store = Arc::new(MemorySessionStore::with_session(Session::new(
            access.clone(),
            "refresh".into(),
            None,
        )));
        let client = client_with(store);

        let mut request = client.request(Method::GET, "/tasks").build().unwrap();
        let sent = client.gate(&mut request, EndpointKind::Protected).await.unwrap();

        assert_eq!(sent.as_deref(), Some(access.as_str()));
        let header = request.headers().get(header::AUTHORIZATION).unwrap();
        assert_eq!(header.to_str().unwrap(), format!("Bearer {}", access));
        assert!(header.is_sensitive());
    }

    #[tokio::test]
    async fn test_gate_leaves_login_requests_alone() {
        let store = Arc::new(MemorySessionStore::with_session(Session::new(
            token_expiring_in(3600),
            "refresh".into(),
            None,
        )));
        let client = client_with(store);

        let mut request = client.request(Method::POST, "/auth/login").build().unwrap();
        let sent = client.gate(&mut request, EndpointKind::Login).await.unwrap();

        assert!(sent.is_none());
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_gate_failure_terminates_session() {
        let store = Arc::new(MemorySessionStore::with_session(Session::new(
            token_expiring_in(5),
            "refresh".into(),
            None,
        )));
        let client = client_with(store.clone());

        let mut request = client.request(Method::GET, "/tasks").build().unwrap();
        let result = client.gate(&mut request, EndpointKind::Protected).await;

        assert!(matches!(
            result,
            Err(ApiError::SessionExpired(ExpiryCause::RefreshUnavailable))
        ));
        assert!(store.get().unwrap().is_none());
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_anonymous_gate_sends_no_credential() {
        let client = client_with(Arc::new(MemorySessionStore::new()));

        let mut request = client.request(Method::GET, "/public/notices").build().unwrap();
        let sent = client.gate(&mut request, EndpointKind::Protected).await.unwrap();

        assert!(sent.is_none());
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
    }
}
