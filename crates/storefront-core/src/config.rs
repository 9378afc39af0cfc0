//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the API base URL, the storage backend for credentials,
//! the last used username, and the session renewal tuning.
//!
//! Configuration is stored at `~/.config/storefront/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "storefront";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the configured API base URL
pub const API_URL_ENV: &str = "STOREFRONT_API_URL";

/// Default API base URL, useful for a locally running backend.
const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// Renew this long before the access token expires.
/// 60s absorbs moderate clock skew and a slow renewal round trip.
const DEFAULT_SAFETY_MARGIN_SECS: u64 = 60;

/// First retry delay after a transient renewal failure.
const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 2;

/// Upper bound for the renewal retry delay.
/// 60s keeps a recovering backend from being hammered while still healing quickly.
const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;

/// Hard limit for a single renewal call. A hung call would block every waiter.
const DEFAULT_RENEWAL_TIMEOUT_SECS: u64 = 15;

/// HTTP request timeout in seconds for ordinary API calls.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Where the credential pair is persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON file in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Nothing survives a restart
    Memory,
}

/// Lead time before access-token expiry at which the scheduler renews.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMargin {
    /// Fixed number of seconds before expiry
    Fixed { secs: u64 },
    /// Fraction of the lifetime the token has left when the timer is armed.
    /// For a fresh token `0.2` renews at 80% of its lifetime; for one resumed
    /// halfway through, the lead is 20% of the half that remains.
    Fraction { fraction: f64 },
}

impl Default for SafetyMargin {
    fn default() -> Self {
        SafetyMargin::Fixed {
            secs: DEFAULT_SAFETY_MARGIN_SECS,
        }
    }
}

impl SafetyMargin {
    /// Resolve the margin for a token with `lifetime` remaining.
    pub fn lead_time(&self, lifetime: Duration) -> Duration {
        match *self {
            SafetyMargin::Fixed { secs } => Duration::from_secs(secs).min(lifetime),
            SafetyMargin::Fraction { fraction } => {
                lifetime.mul_f64(fraction.clamp(0.0, 1.0))
            }
        }
    }
}

/// Tuning for renewal timing and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub safety_margin: SafetyMargin,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub renewal_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            safety_margin: SafetyMargin::default(),
            initial_backoff_secs: DEFAULT_INITIAL_BACKOFF_SECS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
            renewal_timeout_secs: DEFAULT_RENEWAL_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl SessionSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs).max(self.initial_backoff())
    }

    pub fn renewal_timeout(&self) -> Duration {
        Duration::from_secs(self.renewal_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub last_username: Option<String>,
    pub storage: StorageBackend,
    pub session: SessionSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            last_username: None,
            storage: StorageBackend::default(),
            session: SessionSettings::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env();
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

    /// Apply environment overrides on top of the file contents
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().trim_end_matches('/').to_string();
            }
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

// ============================================================================
// Tests
// ============================================================================
