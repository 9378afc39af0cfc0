use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::storage::KeyValueStore;

/// Storage slot holding the access token and its expiry
const ACCESS_SLOT: &str = "access_token";

/// Storage slot holding the refresh token and its expiry
const REFRESH_SLOT: &str = "refresh_token";

/// An access/refresh token pair. Replaced as a whole on every renewal.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    pub access_expiry: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expiry: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("access_expiry", &self.access_expiry)
            .field("refresh_token", &"<redacted>")
            .field("refresh_expiry", &self.refresh_expiry)
            .finish()
    }
}

impl Credential {
    pub fn is_access_expired(&self) -> bool {
        Utc::now() >= self.access_expiry
    }

    pub fn is_refresh_expired(&self) -> bool {
        Utc::now() >= self.refresh_expiry
    }

    pub fn time_until_access_expiry(&self) -> Duration {
        self.access_expiry - Utc::now()
    }

    pub fn time_until_refresh_expiry(&self) -> Duration {
        self.refresh_expiry - Utc::now()
    }

    /// Get minutes remaining until the access token expires (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_access_expiry().num_minutes().max(0)
    }
}

/// One persisted slot: a token and when it stops being valid.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenSlot {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Holder of the current credential.
///
/// Reads are served from memory; writes go through to the backing
/// [`KeyValueStore`] so a restart can resume the session. A failed write
/// is logged and the in-memory value still wins: losing durability is
/// better than losing the session.
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
    current: RwLock<Option<Credential>>,
    /// Serializes backend writes; never held together with `current`
    persist_lock: Mutex<()>,
}

impl CredentialStore {
    /// Create an empty store without reading the backend
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            current: RwLock::new(None),
            persist_lock: Mutex::new(()),
        }
    }

    /// Create a store seeded from whatever the backend holds
    pub fn open(backend: Arc<dyn KeyValueStore>) -> Self {
        let store = Self::new(backend);
        match store.read_backend() {
            Ok(Some(credential)) => {
                debug!(access_expiry = %credential.access_expiry, "Loaded persisted credential");
                *store.current.write() = Some(credential);
            }
            Ok(None) => debug!("No persisted credential found"),
            Err(e) => warn!(error = %e, "Ignoring unreadable persisted credential"),
        }
        store
    }

    pub fn get(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|c| c.access_token.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_none()
    }

    pub fn set(&self, credential: Credential) {
        self.cache(credential);
        self.persist();
    }

    pub fn clear(&self) {
        *self.current.write() = None;
        self.persist();
    }

    /// Swap the in-memory credential without touching the backend.
    /// Callers follow up with [`persist`](Self::persist) once they have
    /// released any lock of their own.
    pub(crate) fn cache(&self, credential: Credential) {
        *self.current.write() = Some(credential);
    }

    /// Write whatever is in memory right now to the backend.
    ///
    /// The value is read under `persist_lock`, so when writes race the last
    /// one to run stores the latest credential (or its absence).
    pub(crate) fn persist(&self) {
        let _guard = self.persist_lock.lock();
        match self.get() {
            Some(credential) => {
                if let Err(e) = self.write_backend(&credential) {
                    warn!(error = %e, "Failed to persist credential");
                }
            }
            None => {
                for slot in [ACCESS_SLOT, REFRESH_SLOT] {
                    if let Err(e) = self.backend.remove(slot) {
                        warn!(slot, error = %e, "Failed to remove persisted credential slot");
                    }
                }
            }
        }
    }

    fn read_backend(&self) -> Result<Option<Credential>> {
        let access = self.backend.get(ACCESS_SLOT)?;
        let refresh = self.backend.get(REFRESH_SLOT)?;
        let (Some(access), Some(refresh)) = (access, refresh) else {
            return Ok(None);
        };

        let access: TokenSlot =
            serde_json::from_str(&access).context("Failed to parse access token slot")?;
        let refresh: TokenSlot =
            serde_json::from_str(&refresh).context("Failed to parse refresh token slot")?;

        Ok(Some(Credential {
            access_token: access.token,
            access_expiry: access.expires_at,
            refresh_token: refresh.token,
            refresh_expiry: refresh.expires_at,
        }))
    }

    fn write_backend(&self, credential: &Credential) -> Result<()> {
        let access = TokenSlot {
            token: credential.access_token.clone(),
            expires_at: credential.access_expiry,
        };
        let refresh = TokenSlot {
            token: credential.refresh_token.clone(),
            expires_at: credential.refresh_expiry,
        };
        self.backend.set(REFRESH_SLOT, &serde_json::to_string(&refresh)?)?;
        self.backend.set(ACCESS_SLOT, &serde_json::to_string(&access)?)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
