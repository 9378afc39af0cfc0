use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// Capacity of the outward notification channel.
/// Only login and teardown are published, so a handful is plenty.
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Anonymous,
    Authenticated,
    Renewing,
    Terminated,
}

impl SessionState {
    /// Whether requests may still carry this session's token
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Renewing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationReason {
    Logout,
    RenewalRejected,
}

/// Published to the surrounding application, e.g. to route to a login screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Authenticated,
    Terminated { reason: TerminationReason },
}

/// State plus the epoch it belongs to. Every login opens a new epoch so that
/// work started under an old session can recognise it has been superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub epoch: u64,
}

impl SessionSnapshot {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

struct Inner {
    epoch: u64,
    torn_down: bool,
}

/// Session state machine.
///
/// ```text
/// Anonymous ──login──▶ Authenticated ◀──▶ Renewing
///     ▲                      │               │
///     └──── Terminated ◀─────┴─ rejected / logout
/// ```
///
/// The one-shot `torn_down` flag makes teardown idempotent: however many
/// failures race to end the session, only the first wins and only one
/// `Terminated` event is published.
pub struct SessionLifecycle {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLifecycle {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionSnapshot {
            state: SessionState::Anonymous,
            epoch: 0,
        });
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            // Nothing to tear down before the first login
            inner: Mutex::new(Inner {
                epoch: 0,
                torn_down: true,
            }),
            state_tx,
            events,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        *self.state_tx.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().state
    }

    pub fn is_active(&self) -> bool {
        self.snapshot().is_active()
    }

    /// Observe state transitions (used by the scheduler and pending renewals)
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    /// Subscribe to the outward notification channel
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Open a new session epoch after a successful login or restore
    pub fn authenticated(&self) -> u64 {
        let epoch = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            inner.torn_down = false;
            self.publish_state(SessionState::Authenticated, inner.epoch);
            inner.epoch
        };
        info!(epoch, "Session authenticated");
        let _ = self.events.send(SessionEvent::Authenticated);
        epoch
    }

    /// Authenticated → Renewing. Returns false if `epoch` is no longer live.
    pub fn renewal_started(&self, epoch: u64) -> bool {
        let inner = self.inner.lock();
        if inner.epoch != epoch || inner.torn_down {
            return false;
        }
        self.publish_state(SessionState::Renewing, epoch);
        true
    }

    /// Renewing → Authenticated, whatever the outcome short of rejection
    pub fn renewal_finished(&self, epoch: u64) {
        let inner = self.inner.lock();
        if inner.epoch == epoch && !inner.torn_down {
            self.publish_state(SessionState::Authenticated, epoch);
        }
    }

    /// Run `commit` only while `epoch` is the live, untorn session.
    ///
    /// Holding the lock across `commit` orders it against [`begin_teardown`]:
    /// a credential written here is either visible to teardown (and cleared)
    /// or never written at all.
    ///
    /// [`begin_teardown`]: SessionLifecycle::begin_teardown
    pub fn commit_if_live<F: FnOnce()>(&self, epoch: u64, commit: F) -> bool {
        let inner = self.inner.lock();
        if inner.epoch != epoch || inner.torn_down {
            return false;
        }
        commit();
        true
    }

    /// Claim the teardown of `epoch` (or of the current session when `None`).
    /// Only the first caller per session gets `true`; it must follow up with
    /// [`finish_teardown`](SessionLifecycle::finish_teardown).
    pub fn begin_teardown(&self, epoch: Option<u64>) -> bool {
        let mut inner = self.inner.lock();
        if inner.torn_down || epoch.is_some_and(|e| e != inner.epoch) {
            debug!(?epoch, current = inner.epoch, "Teardown already handled");
            return false;
        }
        inner.torn_down = true;
        self.publish_state(SessionState::Terminated, inner.epoch);
        true
    }

    /// Terminated → Anonymous, publishing the one teardown notification
    pub fn finish_teardown(&self, reason: TerminationReason) {
        {
            let inner = self.inner.lock();
            if self.state_tx.borrow().state == SessionState::Terminated {
                self.publish_state(SessionState::Anonymous, inner.epoch);
            }
        }
        info!(?reason, "Session terminated");
        let _ = self.events.send(SessionEvent::Terminated { reason });
    }

    /// Resolves once session `epoch` is over: torn down, or replaced by a new login
    pub async fn ended(&self, epoch: u64) {
        let mut rx = self.watch();
        loop {
            let current = *rx.borrow_and_update();
            if current.epoch != epoch || !current.is_active() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn publish_state(&self, state: SessionState, epoch: u64) {
        self.state_tx.send_replace(SessionSnapshot { state, epoch });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_anonymous() {
        let lifecycle = SessionLifecycle::new();
        assert_eq!(lifecycle.state(), SessionState::Anonymous);
        assert!(!lifecycle.is_active());
        // Nothing to tear down yet
        assert!(!lifecycle.begin_teardown(None));
    }

    #[test]
    fn test_login_renew_cycle() {
        let lifecycle = SessionLifecycle::new();
        let mut events = lifecycle.subscribe();

        let epoch = lifecycle.authenticated();
        assert_eq!(lifecycle.state(), SessionState::Authenticated);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Authenticated);

        assert!(lifecycle.renewal_started(epoch));
        assert_eq!(lifecycle.state(), SessionState::Renewing);
        assert!(lifecycle.is_active());

        lifecycle.renewal_finished(epoch);
        assert_eq!(lifecycle.state(), SessionState::Authenticated);
    }

    #[test]
    fn test_teardown_is_one_shot() {
        let lifecycle = SessionLifecycle::new();
        let mut events = lifecycle.subscribe();
        let epoch = lifecycle.authenticated();
        let _ = events.try_recv();

        assert!(lifecycle.begin_teardown(Some(epoch)));
        assert_eq!(lifecycle.state(), SessionState::Terminated);
        assert!(!lifecycle.begin_teardown(Some(epoch)));
        assert!(!lifecycle.begin_teardown(None));

        lifecycle.finish_teardown(TerminationReason::RenewalRejected);
        assert_eq!(lifecycle.state(), SessionState::Anonymous);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated { reason: TerminationReason::RenewalRejected }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_stale_epoch_is_ignored() {
        let lifecycle = SessionLifecycle::new();
        let old = lifecycle.authenticated();
        assert!(lifecycle.begin_teardown(None));
        lifecycle.finish_teardown(TerminationReason::Logout);
        let new = lifecycle.authenticated();
        assert_ne!(old, new);

        // Signals from the previous session cannot touch the new one
        assert!(!lifecycle.renewal_started(old));
        assert!(!lifecycle.begin_teardown(Some(old)));
        assert!(!lifecycle.commit_if_live(old, || panic!("must not commit")));
        assert_eq!(lifecycle.state(), SessionState::Authenticated);

        let mut committed = false;
        assert!(lifecycle.commit_if_live(new, || committed = true));
        assert!(committed);
    }

    #[test]
    fn test_renewal_finished_after_teardown_keeps_anonymous() {
        let lifecycle = SessionLifecycle::new();
        let epoch = lifecycle.authenticated();
        assert!(lifecycle.renewal_started(epoch));
        assert!(lifecycle.begin_teardown(Some(epoch)));
        lifecycle.finish_teardown(TerminationReason::Logout);

        lifecycle.renewal_finished(epoch);
        assert_eq!(lifecycle.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_watchers_see_termination() {
        let lifecycle = SessionLifecycle::new();
        let epoch = lifecycle.authenticated();
        let mut rx = lifecycle.watch();

        assert!(lifecycle.begin_teardown(Some(epoch)));
        lifecycle.finish_teardown(TerminationReason::Logout);

        let seen = rx.wait_for(|s| !s.is_active()).await.unwrap();
        assert_eq!(seen.epoch, epoch);
    }
}
