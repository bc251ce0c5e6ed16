//! Application configuration management.
//!
//! This module handles loading and saving the configuration: where the API
//! lives, which endpoints issue credentials, how eagerly credentials are
//! refreshed and where the session is kept.
//!
//! Configuration is stored at `~/.config/tokenwarden/config.json`. A few
//! values can be overridden from the environment (see [`Config::apply_env`]).

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tokenwarden";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_API_URL: &str = "TOKENWARDEN_API_URL";
const ENV_STORAGE: &str = "TOKENWARDEN_STORAGE";
const ENV_STORE_PASSPHRASE: &str = "TOKENWARDEN_STORE_PASSPHRASE";

/// Where the session is kept between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Lost when the process exits.
    #[default]
    Memory,
    Keyring,
    EncryptedFile,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "keyring" => Ok(StorageBackend::Keyring),
            "encrypted_file" | "file" => Ok(StorageBackend::EncryptedFile),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    /// Login entry point the host navigates to after the session ends.
    pub login_redirect: String,
    /// Refresh when the access credential has less than this left.
    pub refresh_window_secs: i64,
    pub refresh_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Extra attempts for a token exchange that failed in transit.
    pub refresh_retries: u32,
    pub refresh_backoff_ms: u64,
    /// First wait after a 429 response; doubles on each retry.
    pub rate_limit_backoff_ms: u64,
    pub storage: StorageBackend,
    pub last_username: Option<String>,
    /// Only read from the environment, never written to disk.
    #[serde(skip)]
    pub store_passphrase: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh-token".to_string(),
            login_redirect: "/login".to_string(),
            refresh_window_secs: 60,
            refresh_timeout_secs: 10,
            request_timeout_secs: 30,
            refresh_retries: 0,
            refresh_backoff_ms: 500,
            rate_limit_backoff_ms: 1000,
            storage: StorageBackend::default(),
            last_username: None,
            store_passphrase: None,
        }
    }
}

impl Config {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override values from `TOKENWARDEN_*` variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(storage) = lookup(ENV_STORAGE) {
            match storage.parse() {
                Ok(backend) => self.storage = backend,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_STORAGE),
            }
        }
        if let Some(passphrase) = lookup(ENV_STORE_PASSPHRASE) {
            self.store_passphrase = Some(passphrase);
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "api_base_url": "https://example.org/api", "storage": "keyring" }"#,
        )
        .unwrap();
        assert_eq!(config.api_base_url, "https://example.org/api");
        assert_eq!(config.storage, StorageBackend::Keyring);
        assert_eq!(config.refresh_path, "/auth/refresh-token");
        assert_eq!(config.refresh_window_secs, 60);
        assert_eq!(config.rate_limit_backoff_ms, 1000);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_API_URL, "https://staging.example.org"),
            (ENV_STORAGE, "encrypted_file"),
            (ENV_STORE_PASSPHRASE, "s3cret"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.api_base_url, "https://staging.example.org");
        assert_eq!(config.storage, StorageBackend::EncryptedFile);
        assert_eq!(config.store_passphrase.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_bad_storage_override_is_ignored() {
        let mut config = Config::default();
        config.apply_env(|key| (key == ENV_STORAGE).then(|| "floppy".to_string()));
        assert_eq!(config.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_passphrase_is_never_serialized() {
        let config = Config {
            store_passphrase: Some("s3cret".to_string()),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("s3cret"));
    }
}
