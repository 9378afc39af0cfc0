//! Single-flight token renewal.
//!
//! However many callers need a fresh credential at the same moment, only one
//! renewal call goes out. The first caller installs a [`RenewalAttempt`] in
//! the active slot; everyone arriving while it is there awaits the same
//! shared result. The renewal itself runs as its own task, so a caller that
//! gives up waiting cannot strand the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::renewal::{RenewalClient, RenewalError};
use super::session::{SessionLifecycle, TerminationReason};
use super::{Credential, CredentialStore};

type RenewalResult = Result<Credential, RenewalError>;

/// The one renewal in flight.
#[derive(Clone)]
pub struct RenewalAttempt {
    pub id: u64,
    /// Session the attempt renews for
    pub epoch: u64,
    pub started_at: Instant,
    result: Shared<BoxFuture<'static, RenewalResult>>,
}

impl RenewalAttempt {
    pub async fn wait(self) -> RenewalResult {
        self.result.await
    }
}

enum Acquire {
    /// A credential newer than the caller's is already in the store
    Ready(Credential),
    Wait(RenewalAttempt),
}

/// Owner of the credential store and the active-attempt slot. All writes to
/// either go through here.
pub struct SingleFlightCoordinator {
    store: CredentialStore,
    client: Arc<dyn RenewalClient>,
    lifecycle: Arc<SessionLifecycle>,
    renewal_timeout: Duration,
    slot: Mutex<Option<RenewalAttempt>>,
    attempts: AtomicU64,
}

impl SingleFlightCoordinator {
    pub fn new(
        store: CredentialStore,
        client: Arc<dyn RenewalClient>,
        lifecycle: Arc<SessionLifecycle>,
        renewal_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            lifecycle,
            renewal_timeout,
            slot: Mutex::new(None),
            attempts: AtomicU64::new(0),
        })
    }

    pub fn lifecycle(&self) -> &Arc<SessionLifecycle> {
        &self.lifecycle
    }

    pub fn current(&self) -> Option<Credential> {
        self.store.get()
    }

    pub fn access_token(&self) -> Option<String> {
        self.store.access_token()
    }

    /// The renewal currently in flight, if any
    pub fn active_attempt(&self) -> Option<RenewalAttempt> {
        self.slot.lock().clone()
    }

    /// Number of renewal attempts started since creation
    pub fn attempts_started(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Renew the credential, or join the renewal already in flight.
    pub async fn acquire_credential(self: &Arc<Self>) -> RenewalResult {
        match self.attach_or_start(None)? {
            Acquire::Ready(credential) => Ok(credential),
            Acquire::Wait(attempt) => attempt.wait().await,
        }
    }

    /// Like [`acquire_credential`](Self::acquire_credential), for a caller
    /// whose request was refused with `stale_token`. If the store already
    /// holds a different token, someone else has renewed in the meantime and
    /// that credential is returned without another network call.
    pub async fn renew_stale(self: &Arc<Self>, stale_token: &str) -> RenewalResult {
        match self.attach_or_start(Some(stale_token))? {
            Acquire::Ready(credential) => Ok(credential),
            Acquire::Wait(attempt) => attempt.wait().await,
        }
    }

    /// Start a session with a credential obtained by logging in.
    /// Any session still live is torn down first. Returns the new epoch.
    pub fn install(&self, credential: Credential) -> u64 {
        self.terminate(None, TerminationReason::Logout);
        self.store.set(credential);
        self.lifecycle.authenticated()
    }

    /// Resume a persisted session if its refresh token is still usable.
    pub fn resume(&self) -> Option<u64> {
        let credential = self.store.get()?;
        if credential.is_refresh_expired() {
            info!("Persisted refresh token has expired; discarding");
            self.store.clear();
            return None;
        }
        if self.lifecycle.is_active() {
            return Some(self.lifecycle.snapshot().epoch);
        }
        Some(self.lifecycle.authenticated())
    }

    /// Tear down session `epoch` (or the live one when `None`) exactly once.
    /// Returns whether this call performed the teardown.
    pub fn terminate(&self, epoch: Option<u64>, reason: TerminationReason) -> bool {
        if !self.lifecycle.begin_teardown(epoch) {
            // Nothing live to tear down, but an explicit logout still
            // forgets a credential persisted by an earlier run
            if epoch.is_none() && reason == TerminationReason::Logout {
                self.store.clear();
            }
            return false;
        }
        self.store.clear();
        self.lifecycle.finish_teardown(reason);
        true
    }

    /// Atomic check-and-set on the active slot.
    fn attach_or_start(self: &Arc<Self>, stale_token: Option<&str>) -> Result<Acquire, RenewalError> {
        let mut slot = self.slot.lock();
        let snapshot = self.lifecycle.snapshot();

        if let Some(active) = slot.as_ref() {
            if active.epoch == snapshot.epoch {
                debug!(attempt = active.id, "Joining renewal in flight");
                return Ok(Acquire::Wait(active.clone()));
            }
            // Left over from a session that has since been replaced
            debug!(attempt = active.id, epoch = active.epoch, "Superseding stale renewal");
        }

        let current = match self.store.get() {
            Some(credential) if snapshot.is_active() => credential,
            _ => return Err(RenewalError::SessionEnded),
        };

        if let Some(stale) = stale_token {
            if current.access_token != stale {
                debug!("Credential already renewed by another caller");
                return Ok(Acquire::Ready(current));
            }
        }

        let id = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_attempt(id, snapshot.epoch, current).await });
        let result = task
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(RenewalError::Unavailable(format!("Renewal task failed: {}", e)))
                })
            })
            .boxed()
            .shared();

        let attempt = RenewalAttempt {
            id,
            epoch: snapshot.epoch,
            started_at: Instant::now(),
            result,
        };
        *slot = Some(attempt.clone());
        Ok(Acquire::Wait(attempt))
    }

    async fn run_attempt(self: Arc<Self>, id: u64, epoch: u64, current: Credential) -> RenewalResult {
        let outcome = self.renew_for(id, epoch, &current).await;

        match &outcome {
            Ok(credential) => {
                self.lifecycle.renewal_finished(epoch);
                info!(attempt = id, access_expiry = %credential.access_expiry, "Access token renewed");
            }
            Err(RenewalError::Rejected(reason)) => {
                warn!(attempt = id, reason = %reason, "Refresh token rejected; ending session");
                self.terminate(Some(epoch), TerminationReason::RenewalRejected);
            }
            Err(RenewalError::Unavailable(reason)) => {
                self.lifecycle.renewal_finished(epoch);
                warn!(attempt = id, reason = %reason, "Token renewal unavailable");
            }
            Err(RenewalError::SessionEnded) => {
                debug!(attempt = id, "Session ended during renewal");
            }
        }

        self.release(id);
        outcome
    }

    async fn renew_for(&self, id: u64, epoch: u64, current: &Credential) -> RenewalResult {
        if !self.lifecycle.renewal_started(epoch) {
            return Err(RenewalError::SessionEnded);
        }
        if current.is_refresh_expired() {
            return Err(RenewalError::Rejected("Refresh token has expired".to_string()));
        }

        info!(attempt = id, "Renewing access token");
        let renewed = tokio::select! {
            result = tokio::time::timeout(self.renewal_timeout, self.client.renew(current)) => {
                match result {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(RenewalError::Unavailable(format!(
                            "Renewal timed out after {}s",
                            self.renewal_timeout.as_secs()
                        )));
                    }
                }
            }
            _ = self.lifecycle.ended(epoch) => return Err(RenewalError::SessionEnded),
        };

        // Swapping under the lifecycle lock keeps a logout from being undone
        // by a renewal that finished just after it. Backend IO happens after.
        if self
            .lifecycle
            .commit_if_live(epoch, || self.store.cache(renewed.clone()))
        {
            self.store.persist();
            Ok(renewed)
        } else {
            Err(RenewalError::SessionEnded)
        }
    }

    fn release(&self, id: u64) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|active| active.id == id) {
            *slot = None;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
