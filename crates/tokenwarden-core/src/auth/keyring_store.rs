use std::sync::Mutex;

use keyring::Entry;
use tracing::debug;

use super::session::{Session, SessionStore, StoreError};

const SERVICE_NAME: &str = "tokenwarden";

/// Keychain account the session lives under.
///
/// Fixed rather than per-user: the store is opened before anyone has logged
/// in, and the next process has to find the same entry.
pub const SESSION_ACCOUNT: &str = "session";

/// Keep the session in the OS keychain.
///
/// The whole session is serialized into one keychain entry, so the access
/// credential, refresh credential and role are always written and deleted
/// together.
pub struct KeyringSessionStore {
    entry: Entry,
    account: String,
    write_lock: Mutex<()>,
}

impl KeyringSessionStore {
    /// Open the entry the CLI keeps its session in.
    pub fn open() -> Result<Self, StoreError> {
        Self::new(SESSION_ACCOUNT)
    }

    pub fn new(account: &str) -> Result<Self, StoreError> {
        let entry = Entry::new(SERVICE_NAME, account)?;
        Ok(Self {
            entry,
            account: account.to_string(),
            write_lock: Mutex::new(()),
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    fn write(&self, session: &Session) -> Result<(), StoreError> {
        let secret = serde_json::to_string(session)?;
        self.entry.set_password(&secret)?;
        debug!("Session written to keychain");
        Ok(())
    }
}

impl SessionStore for KeyringSessionStore {
    fn get(&self) -> Result<Option<Session>, StoreError> {
        match self.entry.get_password() {
            Ok(secret) => Ok(Some(serde_json::from_str(&secret)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.write(session)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn replace_if_current(&self, expected: &Session, next: &Session) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        if self.get()?.as_ref() != Some(expected) {
            return Ok(false);
        }
        self.write(next)?;
        Ok(true)
    }
}
