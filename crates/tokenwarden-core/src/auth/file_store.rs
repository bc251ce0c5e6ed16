use std::path::{Path, PathBuf};
use std::sync::Mutex;

use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::session::{Session, SessionStore, StoreError};

/// Session file name in cache directory
const SESSION_FILE: &str = "session.enc";

/// Length of the argon2 salt stored alongside the ciphertext
const SALT_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct SealedSession {
    salt: String,
    nonce: String,
    ciphertext: String,
}

struct DerivedKey {
    salt: [u8; SALT_LEN],
    key: Key,
}

/// Keep the session in an encrypted file under the cache directory.
///
/// The key is derived from a passphrase with argon2 and cached per salt,
/// so only the first read after startup pays for the derivation. Writes go
/// to a temporary file that is renamed over the old one, which means a
/// concurrent reader sees either the previous session or the new one.
pub struct EncryptedFileSessionStore {
    path: PathBuf,
    passphrase: String,
    key: Mutex<Option<DerivedKey>>,
    write_lock: Mutex<()>,
}

impl EncryptedFileSessionStore {
    pub fn new(cache_dir: &Path, passphrase: impl Into<String>) -> Self {
        Self {
            path: cache_dir.join(SESSION_FILE),
            passphrase: passphrase.into(),
            key: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn derive(&self, salt: &[u8; SALT_LEN]) -> Result<Key, StoreError> {
        let mut cached = self.key.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(ref derived) = *cached {
            if &derived.salt == salt {
                return Ok(derived.key);
            }
        }

        let mut key = Key::default();
        Argon2::default()
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        *cached = Some(DerivedKey { salt: *salt, key });
        Ok(key)
    }

    /// Salt to seal with: reuse the cached one, otherwise pick a new one.
    fn current_salt(&self) -> Result<[u8; SALT_LEN], StoreError> {
        let cached = self.key.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(ref derived) = *cached {
            return Ok(derived.salt);
        }
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Ok(salt)
    }

    fn write(&self, session: &Session) -> Result<(), StoreError> {
        let salt = self.current_salt()?;
        let cipher = ChaCha20Poly1305::new(&self.derive(&salt)?);
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let plaintext = serde_json::to_vec(session)?;
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        let sealed = SealedSession {
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&sealed)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Session written to disk");
        Ok(())
    }

    fn decode_field(field: &str) -> Result<Vec<u8>, StoreError> {
        STANDARD
            .decode(field)
            .map_err(|e| StoreError::Crypto(format!("invalid encoding: {}", e)))
    }
}

impl SessionStore for EncryptedFileSessionStore {
    fn get(&self) -> Result<Option<Session>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let sealed: SealedSession = serde_json::from_str(&contents)?;

        let salt: [u8; SALT_LEN] = Self::decode_field(&sealed.salt)?
            .try_into()
            .map_err(|_| StoreError::Crypto("invalid salt length".to_string()))?;
        let nonce_bytes = Self::decode_field(&sealed.nonce)?;
        if nonce_bytes.len() != 12 {
            return Err(StoreError::Crypto("invalid nonce length".to_string()));
        }
        let ciphertext = Self::decode_field(&sealed.ciphertext)?;

        let cipher = ChaCha20Poly1305::new(&self.derive(&salt)?);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| {
                StoreError::Crypto("wrong passphrase or tampered session file".to_string())
            })?;

        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    fn set(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.write(session)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
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

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Session {
        Session::new("access".into(), "refresh".into(), Some("admin".into()))
    }

    #[test]
    fn test_session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileSessionStore::new(dir.path(), "hunter2");
        assert_eq!(store.get().unwrap(), None);

        store.set(&sample()).unwrap();

        // A fresh store (new process) can read it back with the same passphrase
        let reopened = EncryptedFileSessionStore::new(dir.path(), "hunter2");
        assert_eq!(reopened.get().unwrap(), Some(sample()));
    }

    #[test]
    fn test_file_does_not_contain_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileSessionStore::new(dir.path(), "hunter2");
        store.set(&sample()).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("refresh"));
        assert!(!raw.contains("admin"));
    }

    #[test]
    fn test_wrong_passphrase_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        EncryptedFileSessionStore::new(dir.path(), "hunter2")
            .set(&sample())
            .unwrap();

        let other = EncryptedFileSessionStore::new(dir.path(), "letmein");
        assert!(matches!(other.get(), Err(StoreError::Crypto(_))));
    }

    #[test]
    fn test_replace_is_refused_after_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileSessionStore::new(dir.path(), "hunter2");
        store.set(&sample()).unwrap();

        let rotated = Session::new("access-2".into(), "refresh".into(), Some("admin".into()));
        assert!(store.replace_if_current(&sample(), &rotated).unwrap());
        assert_eq!(store.get().unwrap(), Some(rotated.clone()));

        store.clear().unwrap();
        assert!(!store.replace_if_current(&rotated, &sample()).unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileSessionStore::new(dir.path(), "hunter2");
        store.set(&sample()).unwrap();
        assert!(store.path().exists());

        store.clear().unwrap();
        assert!(!store.path().exists());
        assert_eq!(store.get().unwrap(), None);
        store.clear().unwrap();
    }
}
