//! Session facade used by applications.
//!
//! `SessionManager` wires the credential store, renewal client, coordinator
//! and scheduler together and exposes the handful of things an application
//! needs: log in, resume, log out, watch for teardown, and get an
//! [`ApiClient`] whose requests keep the session alive.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use super::renewal::{HttpAuthClient, RenewalClient};
use super::scheduler::ProactiveScheduler;
use super::session::{SessionLifecycle, SessionState, TerminationReason};
use super::storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};
use super::{Credential, CredentialStore, SessionEvent, SingleFlightCoordinator};
use crate::api::{ApiClient, HttpTransport, ReactiveInterceptor, Transport};
use crate::config::{Config, SessionSettings, StorageBackend};

/// Session status for display.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub state: SessionState,
    pub access_expires_in: Option<Duration>,
    pub refresh_expires_in: Option<Duration>,
    pub renewals: u64,
}

impl SessionInfo {
    pub fn expires_in_display(&self) -> String {
        match self.access_expires_in {
            None => "no session".to_string(),
            Some(d) if d <= Duration::zero() => "expired (renews on next use)".to_string(),
            Some(d) => {
                let minutes = d.num_minutes();
                if minutes >= 60 {
                    format!("{}h {}m", minutes / 60, minutes % 60)
                } else if minutes >= 1 {
                    format!("{}m", minutes)
                } else {
                    format!("{}s", d.num_seconds())
                }
            }
        }
    }
}

pub struct SessionManager {
    coordinator: Arc<SingleFlightCoordinator>,
    transport: Arc<dyn Transport>,
    auth: HttpAuthClient,
    settings: SessionSettings,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        renewal: Arc<dyn RenewalClient>,
        store: CredentialStore,
        settings: SessionSettings,
    ) -> Self {
        let coordinator = SingleFlightCoordinator::new(
            store,
            renewal,
            Arc::new(SessionLifecycle::new()),
            settings.renewal_timeout(),
        );
        Self {
            coordinator,
            auth: HttpAuthClient::new(Arc::clone(&transport)),
            transport,
            settings,
            scheduler: Mutex::new(None),
        }
    }

    /// Build a manager talking HTTP to `config.api_base_url`, with the
    /// persisted credential (if any) loaded from the configured backend.
    pub fn connect(config: &Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(
            HttpTransport::new(&config.api_base_url, config.session.request_timeout())
                .context("Failed to build HTTP client")?,
        );
        let renewal: Arc<dyn RenewalClient> = Arc::new(HttpAuthClient::new(Arc::clone(&transport)));
        let store = CredentialStore::open(open_storage(config)?);
        Ok(Self::new(transport, renewal, store, config.session.clone()))
    }

    pub fn coordinator(&self) -> &Arc<SingleFlightCoordinator> {
        &self.coordinator
    }

    pub fn state(&self) -> SessionState {
        self.coordinator.lifecycle().state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.coordinator.lifecycle().is_active()
    }

    /// Notifications for the surrounding application
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.lifecycle().subscribe()
    }

    /// Authenticate with username and password and start a session
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let credential = self.auth.login(username, password).await?;
        self.start_session(credential);
        Ok(())
    }

    /// Start a session from a credential obtained elsewhere
    pub fn start_session(&self, credential: Credential) {
        let epoch = self.coordinator.install(credential);
        info!(epoch, "Session started");
        self.spawn_scheduler();
    }

    /// Resume the persisted session, if one is still renewable
    pub fn restore(&self) -> bool {
        match self.coordinator.resume() {
            Some(epoch) => {
                info!(epoch, "Resumed persisted session");
                self.spawn_scheduler();
                true
            }
            None => false,
        }
    }

    /// End the session. Safe to call when already logged out.
    pub fn logout(&self) {
        self.coordinator.terminate(None, TerminationReason::Logout);
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
        }
    }

    /// API client whose requests renew this session as needed
    pub fn api_client(&self) -> ApiClient {
        ApiClient::new(ReactiveInterceptor::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.coordinator),
        ))
    }

    pub fn info(&self) -> SessionInfo {
        let credential = self.coordinator.current();
        SessionInfo {
            state: self.state(),
            access_expires_in: credential.as_ref().map(|c| c.time_until_access_expiry()),
            refresh_expires_in: credential.as_ref().map(|c| c.time_until_refresh_expiry()),
            renewals: self.coordinator.attempts_started(),
        }
    }

    fn spawn_scheduler(&self) {
        let handle = ProactiveScheduler::new(Arc::clone(&self.coordinator), &self.settings).spawn();
        if let Some(previous) = self.scheduler.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
        }
    }
}

/// Open the key-value backend named in the config
pub fn open_storage(config: &Config) -> Result<Arc<dyn KeyValueStore>> {
    Ok(match config.storage {
        StorageBackend::File => Arc::new(FileStore::new(&config.cache_dir()?)),
        StorageBackend::Keyring => Arc::new(KeyringStore::new()),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::tests::credential;
    use crate::test_support::{ScriptedRenewalClient, TokenCheckingTransport};

    fn manager(
        backend: Arc<dyn KeyValueStore>,
        client: Arc<ScriptedRenewalClient>,
        transport: Arc<TokenCheckingTransport>,
    ) -> SessionManager {
        SessionManager::new(
            transport,
            client,
            CredentialStore::open(backend),
            SessionSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_start_session_and_logout() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let manager = manager(
            backend,
            ScriptedRenewalClient::new(),
            TokenCheckingTransport::accepting(&["access-1"]),
        );
        let mut events = manager.subscribe();
        assert_eq!(manager.state(), SessionState::Anonymous);

        manager.start_session(credential("1", 600));
        assert!(manager.is_authenticated());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Authenticated);

        manager.logout();
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Terminated { reason: TerminationReason::Logout }
        );
        assert!(manager.info().access_expires_in.is_none());

        // Logging out twice is a no-op
        manager.logout();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_restore_resumes_persisted_session() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        {
            let first = manager(
                backend.clone(),
                ScriptedRenewalClient::new(),
                TokenCheckingTransport::accepting(&[]),
            );
            first.start_session(credential("1", 600));
        }

        let second = manager(
            backend,
            ScriptedRenewalClient::new(),
            TokenCheckingTransport::accepting(&["access-1"]),
        );
        assert!(second.restore());
        assert!(second.is_authenticated());

        let echo: serde_json::Value = second.api_client().get("/me").await.unwrap();
        assert_eq!(echo["token"], "access-1");
    }

    #[tokio::test]
    async fn test_logout_before_restore_forgets_persisted_session() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        CredentialStore::new(backend.clone()).set(credential("1", 600));

        // A fresh process logs out without resuming first
        let first = manager(
            backend.clone(),
            ScriptedRenewalClient::new(),
            TokenCheckingTransport::accepting(&[]),
        );
        first.logout();
        assert!(first.info().access_expires_in.is_none());
        drop(first);

        let next = manager(
            backend,
            ScriptedRenewalClient::new(),
            TokenCheckingTransport::accepting(&[]),
        );
        assert!(!next.restore());
        assert_eq!(next.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_restore_without_credential() {
        let manager = manager(
            Arc::new(MemoryStore::new()),
            ScriptedRenewalClient::new(),
            TokenCheckingTransport::accepting(&[]),
        );
        assert!(!manager.restore());
        assert_eq!(manager.info().expires_in_display(), "no session");
    }

    #[tokio::test]
    async fn test_restore_with_expired_access_renews_on_first_request() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        CredentialStore::new(backend.clone()).set(credential("1", -30));
        let client = ScriptedRenewalClient::new();
        let manager = manager(
            backend,
            client.clone(),
            TokenCheckingTransport::accepting(&["access-renewed-1"]),
        );

        assert!(manager.restore());
        let echo: serde_json::Value = manager.api_client().get("/me").await.unwrap();
        assert_eq!(echo["token"], "access-renewed-1");
        assert_eq!(client.calls(), 1);
        assert_eq!(manager.info().renewals, 1);
    }

    #[test]
    fn test_expires_in_display() {
        let mut info = SessionInfo {
            state: SessionState::Authenticated,
            access_expires_in: Some(Duration::minutes(125)),
            refresh_expires_in: None,
            renewals: 0,
        };
        assert_eq!(info.expires_in_display(), "2h 5m");

        info.access_expires_in = Some(Duration::minutes(7));
        assert_eq!(info.expires_in_display(), "7m");

        info.access_expires_in = Some(Duration::seconds(42));
        assert_eq!(info.expires_in_display(), "42s");

        info.access_expires_in = Some(Duration::seconds(-1));
        assert!(info.expires_in_display().starts_with("expired"));
    }
}
