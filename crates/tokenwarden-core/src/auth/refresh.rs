//! Single-flight refresh of the access credential.
//!
//! [`RefreshCoordinator`] is the only writer of new credentials after
//! login. However many requests notice an expiring credential at once,
//! at most one exchange is in flight and every caller that asked while it
//! was outstanding observes its result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::{Session, SessionStore, StoreError};
use super::token::decode_claims;
use crate::config::Config;

/// Margin before expiry inside which the access credential is refreshed.
const DEFAULT_REFRESH_WINDOW_SECS: i64 = 60;

/// Upper bound on one token exchange round trip.
const DEFAULT_EXCHANGE_TIMEOUT_SECS: u64 = 10;

/// Outcome of a refresh attempt. Cloned to every waiter of one operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh credential available")]
    NoRefreshCredential,

    #[error("Token exchange failed: {0}")]
    NetworkFailure(String),

    #[error("Refresh credential rejected (status {status})")]
    Rejected { status: u16 },

    #[error("Invalid token exchange response: {0}")]
    InvalidResponse(String),

    #[error("Session store unavailable: {0}")]
    Store(String),

    #[error("Refresh task aborted: {0}")]
    Aborted(String),
}

impl From<StoreError> for RefreshError {
    fn from(e: StoreError) -> Self {
        RefreshError::Store(e.to_string())
    }
}

impl RefreshError {
    /// Transient failures are the only ones worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, RefreshError::NetworkFailure(_))
    }
}

/// Credentials minted by the token exchange endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub token: String,
    /// Present only when the issuer rotates refresh credentials.
    pub refresh_token: Option<String>,
}

/// The network call that trades a refresh credential for new credentials.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshError>;
}

/// `POST <base>/auth/refresh-token` with the refresh credential as bearer.
#[derive(Clone)]
pub struct HttpTokenExchange {
    client: Client,
    url: String,
}

impl HttpTokenExchange {
    pub fn new(client: Client, base_url: &str, refresh_path: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), refresh_path),
        }
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(refresh_token)
            .send()
            .await
            .map_err(|e| RefreshError::NetworkFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                code @ (400 | 401 | 403) => RefreshError::Rejected { status: code },
                code => RefreshError::NetworkFailure(format!("status {}", code)),
            });
        }

        let pair: TokenPair = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        if pair.token.is_empty() {
            return Err(RefreshError::InvalidResponse("empty access token".to_string()));
        }
        Ok(pair)
    }
}

/// Retry policy for transient exchange failures inside one operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    pub window: chrono::Duration,
    pub exchange_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            window: chrono::Duration::seconds(DEFAULT_REFRESH_WINDOW_SECS),
            exchange_timeout: Duration::from_secs(DEFAULT_EXCHANGE_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for RefreshSettings {
    fn from(config: &Config) -> Self {
        Self {
            window: chrono::Duration::seconds(config.refresh_window_secs),
            exchange_timeout: Duration::from_secs(config.refresh_timeout_secs),
            retry: RetryPolicy {
                max_retries: config.refresh_retries,
                initial_backoff: Duration::from_millis(config.refresh_backoff_ms),
            },
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<(), RefreshError>>>;

/// The outstanding refresh operation, if any.
struct InFlight {
    generation: u64,
    operation: SharedRefresh,
}

/// Why a caller wants a refresh.
enum Trigger<'a> {
    /// The gate saw the credential inside the refresh window.
    Proactive,
    /// The server rejected this exact access credential.
    Rejected(&'a str),
}

struct Inner {
    store: Arc<dyn SessionStore>,
    exchange: Arc<dyn TokenExchange>,
    settings: RefreshSettings,
    in_flight: Mutex<Option<InFlight>>,
    next_generation: AtomicU64,
    /// Bumped under the slot lock each time an operation releases it.
    settled: AtomicU64,
}

/// Cheap to clone; clones share the same in-flight slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        exchange: Arc<dyn TokenExchange>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                exchange,
                settings,
                in_flight: Mutex::new(None),
                next_generation: AtomicU64::new(0),
                settled: AtomicU64::new(0),
            }),
        }
    }

    /// Make sure the stored access credential is outside the refresh window.
    ///
    /// Anonymous callers (no session) succeed without doing anything. A
    /// failure leaves the store untouched; escalating is the caller's call.
    pub async fn ensure_fresh(&self) -> Result<(), RefreshError> {
        self.join_or_start(Trigger::Proactive).await
    }

    /// Refresh after the server rejected `rejected_access`, ignoring the
    /// refresh window.
    ///
    /// If the store already holds a different access credential, someone
    /// else has refreshed since the rejected request was sent and that
    /// credential is used instead of exchanging again.
    pub async fn force_refresh(&self, rejected_access: &str) -> Result<(), RefreshError> {
        self.join_or_start(Trigger::Rejected(rejected_access)).await
    }

    /// Whether a refresh operation is outstanding right now.
    pub fn is_refreshing(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn slot_is_held(&self) -> bool {
        matches!(
            self.inner.in_flight.try_lock(),
            Err(std::sync::TryLockError::WouldBlock)
        )
    }

    fn needs_refresh(&self, session: &Session) -> bool {
        session
            .access()
            .needs_refresh(self.inner.settings.window, Utc::now())
    }

    /// Whether `trigger` still calls for an exchange given what is stored.
    /// `Err` and `Ok(false)` both settle the caller without one.
    fn wants_exchange(&self, trigger: &Trigger<'_>) -> Result<bool, RefreshError> {
        let session = self.inner.store.get()?;
        match (trigger, session) {
            (Trigger::Proactive, None) => Ok(false),
            (Trigger::Proactive, Some(session)) => Ok(self.needs_refresh(&session)),
            (Trigger::Rejected(_), None) => Err(RefreshError::NoRefreshCredential),
            (Trigger::Rejected(rejected), Some(session)) => {
                if session.access_token != *rejected {
                    debug!("Rejected credential already replaced, skipping exchange");
                }
                Ok(session.access_token == *rejected)
            }
        }
    }

    async fn join_or_start(&self, trigger: Trigger<'_>) -> Result<(), RefreshError> {
        let operation = loop {
            // Store reads happen outside the slot lock. If an operation settles
            // between the read and taking the lock, the read may be stale, so
            // it is repeated.
            let seen = self.inner.settled.load(Ordering::Acquire);
            if !self.wants_exchange(&trigger)? {
                return Ok(());
            }

            let mut slot = self
                .inner
                .in_flight
                .lock()
                .map_err(|_| RefreshError::Aborted("refresh slot poisoned".to_string()))?;

            if let Some(in_flight) = slot.as_ref() {
                debug!(generation = in_flight.generation, "Joining outstanding refresh");
                break in_flight.operation.clone();
            }
            if self.inner.settled.load(Ordering::Acquire) != seen {
                continue;
            }

            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let operation = Inner::start(Arc::clone(&self.inner), generation);
            *slot = Some(InFlight {
                generation,
                operation: operation.clone(),
            });
            break operation;
        };

        operation.await
    }
}

impl Inner {
    /// Spawn the exchange so it runs to completion even if every waiter
    /// goes away, and return a handle all waiters can share.
    fn start(inner: Arc<Inner>, generation: u64) -> SharedRefresh {
        info!(generation, "Starting token refresh");
        let task = tokio::spawn(async move {
            let outcome = inner.run().await;
            inner.release(generation);
            match &outcome {
                Ok(()) => info!(generation, "Token refresh succeeded"),
                Err(e) => warn!(generation, error = %e, "Token refresh failed"),
            }
            outcome
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(RefreshError::Aborted(e.to_string())))
        }
        .boxed()
        .shared()
    }

    fn release(&self, generation: u64) {
        if let Ok(mut slot) = self.in_flight.lock() {
            if slot.as_ref().map(|f| f.generation) == Some(generation) {
                *slot = None;
                self.settled.fetch_add(1, Ordering::Release);
            }
        }
    }

    async fn run(&self) -> Result<(), RefreshError> {
        let current = self
            .store
            .get()?
            .filter(Session::has_refresh_token)
            .ok_or(RefreshError::NoRefreshCredential)?;

        let pair = self.exchange_with_retry(&current.refresh_token).await?;

        let mut next = current.clone();
        if let Some(role) = decode_claims(&pair.token).ok().and_then(|c| c.role) {
            next.role = Some(role);
        }
        next.access_token = pair.token;
        if let Some(refresh_token) = pair.refresh_token.filter(|t| !t.is_empty()) {
            next.refresh_token = refresh_token;
        }

        // Commit only over the session the exchange started from. If it was
        // cleared meanwhile the new credentials are dropped.
        if !self.store.replace_if_current(&current, &next)? {
            warn!("Session changed during token exchange, discarding new credentials");
            return Err(RefreshError::NoRefreshCredential);
        }
        Ok(())
    }

    async fn exchange_with_retry(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let retry = self.settings.retry;
        let mut attempt = 0;
        let mut backoff = retry.initial_backoff;

        loop {
            let result = tokio::time::timeout(
                self.settings.exchange_timeout,
                self.exchange.exchange(refresh_token),
            )
            .await
            .unwrap_or_else(|_| {
                Err(RefreshError::NetworkFailure(format!(
                    "timed out after {:?}",
                    self.settings.exchange_timeout
                )))
            });

            match result {
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Token exchange failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                other => return other,
            }
        }
    }
}
