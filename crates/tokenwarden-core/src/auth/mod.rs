//! Session lifecycle: credentials, storage, refresh and termination.
//!
//! This module provides:
//! - `token`: decoding of bearer credential claims (expiry, role)
//! - `Session` / `SessionStore`: all-or-nothing session storage, with
//!   in-memory, OS keychain and encrypted file backends
//! - `RefreshCoordinator`: single-flight exchange of the refresh credential
//! - `SessionTerminator`: the one place a session is torn down

pub mod file_store;
pub mod keyring_store;
pub mod refresh;
pub mod session;
pub mod terminator;
pub mod token;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{Config, StorageBackend};

pub use file_store::EncryptedFileSessionStore;
pub use keyring_store::KeyringSessionStore;
pub use refresh::{
    HttpTokenExchange, RefreshCoordinator, RefreshError, RefreshSettings, RetryPolicy,
    TokenExchange, TokenPair,
};
pub use session::{MemorySessionStore, Session, SessionStore, StoreError};
pub use terminator::{
    ExpiryCause, LoginRedirect, SessionListener, SessionTerminator, TerminationReason,
};
pub use token::{decode_claims, decode_expiry, Claims, Credential, DecodeError};

/// Open the session store selected by the configuration.
pub fn open_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match config.storage {
        StorageBackend::Memory => Arc::new(MemorySessionStore::new()),
        StorageBackend::Keyring => {
            Arc::new(KeyringSessionStore::open().context("Failed to open keychain entry")?)
        }
        StorageBackend::EncryptedFile => {
            let passphrase = config.store_passphrase.clone().ok_or_else(|| {
                anyhow::anyhow!(
                    "TOKENWARDEN_STORE_PASSPHRASE must be set for the encrypted file store"
                )
            })?;
            Arc::new(EncryptedFileSessionStore::new(&config.cache_dir()?, passphrase))
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypted_store_requires_passphrase() {
        let config = Config {
            storage: StorageBackend::EncryptedFile,
            store_passphrase: None,
            ..Config::default()
        };
        assert!(open_store(&config).is_err());
    }

    #[test]
    fn test_keyring_session_survives_username_change() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());

        // Opening the store must not depend on who logged in last, or the
        // next process would look for the session under a different entry
        let before_login = Config {
            storage: StorageBackend::Keyring,
            last_username: None,
            ..Config::default()
        };
        let after_login = Config {
            last_username: Some("alice".to_string()),
            ..before_login.clone()
        };
        assert!(open_store(&before_login).is_ok());
        assert!(open_store(&after_login).is_ok());
        assert_eq!(
            KeyringSessionStore::open().unwrap().account(),
            keyring_store::SESSION_ACCOUNT
        );
    }

    #[test]
    fn test_memory_store_starts_empty() {
        let store = open_store(&Config::default()).unwrap();
        assert!(store.get().unwrap().is_none());
    }
}
