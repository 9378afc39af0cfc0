//! Timer-driven renewal ahead of access-token expiry.
//!
//! One scheduler task runs per session epoch. It sleeps until
//! `access_expiry - safety_margin`, renews through the coordinator, and arms
//! itself again from whatever credential comes back. Transient failures are
//! retried with capped exponential backoff; a rejection or the end of the
//! session stops the task.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::coordinator::SingleFlightCoordinator;
use super::renewal::RenewalError;
use super::Credential;
use crate::config::{SafetyMargin, SessionSettings};

/// Upper bound on random jitter added to a retry delay, as a fraction of it.
/// Spreads retries from many clients after a backend outage.
const BACKOFF_JITTER: f64 = 0.1;

/// Shortest wait after a successful renewal before the next one.
/// Applies when the margin covers a fresh token's whole lifetime.
const MIN_REARM_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ProactiveScheduler {
    coordinator: Arc<SingleFlightCoordinator>,
    margin: SafetyMargin,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ProactiveScheduler {
    pub fn new(coordinator: Arc<SingleFlightCoordinator>, settings: &SessionSettings) -> Self {
        Self {
            coordinator,
            margin: settings.safety_margin,
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
        }
    }

    /// How long to wait before renewing `credential`: `expiry - margin`,
    /// or zero when that moment has already passed.
    pub fn renewal_delay(&self, credential: &Credential) -> Duration {
        let lifetime = credential
            .time_until_access_expiry()
            .to_std()
            .unwrap_or(Duration::ZERO);
        lifetime.saturating_sub(self.margin.lead_time(lifetime))
    }

    /// Delay after `credential` was just renewed
    fn rearm_delay(&self, credential: &Credential) -> Duration {
        self.renewal_delay(credential).max(MIN_REARM_DELAY)
    }

    /// Delay before retry number `attempt` (1-based), before jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Start the timer for the session that is live right now.
    pub fn spawn(self) -> JoinHandle<()> {
        let epoch = self.coordinator.lifecycle().snapshot().epoch;
        tokio::spawn(self.run(epoch))
    }

    async fn run(self, epoch: u64) {
        let lifecycle = Arc::clone(self.coordinator.lifecycle());
        let Some(mut armed_for) = self.coordinator.current() else {
            return;
        };
        let mut delay = self.renewal_delay(&armed_for);
        let mut failures: u32 = 0;

        loop {
            debug!(epoch, delay_secs = delay.as_secs(), "Proactive renewal armed");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = lifecycle.ended(epoch) => {
                    debug!(epoch, "Session over; scheduler stopping");
                    return;
                }
            }

            let snapshot = lifecycle.snapshot();
            if snapshot.epoch != epoch || !snapshot.is_active() {
                return;
            }

            // A reactive renewal may have replaced the credential while we slept
            match self.coordinator.current() {
                Some(current) if current.access_token != armed_for.access_token => {
                    debug!(epoch, "Credential renewed elsewhere; re-arming");
                    failures = 0;
                    delay = self.rearm_delay(&current);
                    armed_for = current;
                    continue;
                }
                Some(_) => {}
                None => return,
            }

            info!(epoch, "Proactive renewal firing");
            match self.coordinator.acquire_credential().await {
                Ok(credential) => {
                    failures = 0;
                    delay = self.rearm_delay(&credential);
                    armed_for = credential;
                }
                Err(RenewalError::Unavailable(reason)) => {
                    failures += 1;
                    delay = with_jitter(self.backoff_delay(failures));
                    warn!(
                        epoch,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Proactive renewal failed; backing off"
                    );
                }
                Err(RenewalError::Rejected(_)) | Err(RenewalError::SessionEnded) => {
                    debug!(epoch, "Session ended; scheduler stopping");
                    return;
                }
            }
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0.0..=BACKOFF_JITTER);
    delay + delay.mul_f64(extra)
}

// ============================================================================
// Tests
// ============================================================================
