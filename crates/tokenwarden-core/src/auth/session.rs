use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::token::{decode_claims, Credential};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored session is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain access failed: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Session encryption failed: {0}")]
    Crypto(String),

    #[error("Session store lock poisoned")]
    Poisoned,
}

/// An authenticated session: both credentials plus the claims the host
/// needs to decide what to show.
///
/// Stores persist this as a single value, which is what keeps a session
/// either fully present or fully absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub role: Option<String>,
}

impl Session {
    /// Build a session, falling back to the access token's `role` claim
    /// when the issuer didn't return one alongside it.
    pub fn new(access_token: String, refresh_token: String, role: Option<String>) -> Self {
        let role = role.or_else(|| {
            decode_claims(&access_token)
                .ok()
                .and_then(|claims| claims.role)
        });
        Self {
            access_token,
            refresh_token,
            role,
        }
    }

    pub fn access(&self) -> Credential<'_> {
        Credential::parse(&self.access_token)
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

/// Process-wide storage for the current session.
///
/// Implementations never expose a half-written session: `set` replaces
/// both credentials and the role in one write, `clear` removes all three.
/// A refresh commits through `replace_if_current`, so it can never write
/// over a `clear` that landed while the exchange was in flight.
pub trait SessionStore: Send + Sync {
    fn get(&self) -> Result<Option<Session>, StoreError>;

    fn set(&self, session: &Session) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Write `next` only if the stored session is still `expected`.
    ///
    /// The check and the write must be atomic with respect to `clear`, so a
    /// session cleared while a refresh was in flight stays cleared. Returns
    /// whether the write happened.
    fn replace_if_current(&self, expected: &Session, next: &Session) -> Result<bool, StoreError>;
}

/// Session storage that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self) -> Result<Option<Session>, StoreError> {
        let guard = self.session.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.clone())
    }

    fn set(&self, session: &Session) -> Result<(), StoreError> {
        let mut guard = self.session.write().map_err(|_| StoreError::Poisoned)?;
        *guard = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.session.write().map_err(|_| StoreError::Poisoned)?;
        *guard = None;
        Ok(())
    }

    fn replace_if_current(&self, expected: &Session, next: &Session) -> Result<bool, StoreError> {
        let mut guard = self.session.write().map_err(|_| StoreError::Poisoned)?;
        if guard.as_ref() != Some(expected) {
            return Ok(false);
        }
        *guard = Some(next.clone());
        Ok(true)
    }
}
