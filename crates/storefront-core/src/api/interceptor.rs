//! Transparent recovery from `401` responses.
//!
//! Every request goes through [`ReactiveInterceptor::execute`]. Before
//! sending, the current access token is attached. When the backend answers
//! `401`, the request parks on the coordinator's single renewal and is
//! replayed once with the new token. A second `401` after a successful
//! renewal is final: replaying again could loop forever.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::{RenewalError, SingleFlightCoordinator};

/// Replays allowed per request after a renewal
const MAX_REPLAYS: u32 = 1;

/// A request waiting on (or replayed after) a renewal.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: ApiRequest,
    pub retry_count: u32,
}

impl PendingRequest {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            retry_count: 0,
        }
    }

    pub fn can_replay(&self) -> bool {
        self.retry_count < MAX_REPLAYS
    }
}

pub struct ReactiveInterceptor {
    transport: Arc<dyn Transport>,
    coordinator: Arc<SingleFlightCoordinator>,
}

impl ReactiveInterceptor {
    pub fn new(transport: Arc<dyn Transport>, coordinator: Arc<SingleFlightCoordinator>) -> Self {
        Self {
            transport,
            coordinator,
        }
    }

    /// Send `request`, renewing and replaying once on an auth failure.
    ///
    /// Non-auth failures are returned as responses for the caller to map;
    /// only session-level outcomes become errors here.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let lifecycle = self.coordinator.lifecycle();
        let mut pending = PendingRequest::new(request);
        let first_epoch = lifecycle.snapshot().epoch;

        loop {
            // Pre-request hook
            let sent_under = lifecycle.snapshot();
            let session_gone = sent_under.epoch != first_epoch || !sent_under.is_active();
            if pending.retry_count > 0 && session_gone {
                debug!(path = %pending.request.path, "Session ended before replay");
                return Err(ApiError::ConcurrentTeardown);
            }
            let token = self.coordinator.access_token();
            let response = self
                .transport
                .send(&pending.request, token.as_deref())
                .await?;

            // Post-response hook
            if !response.is_auth_failure() {
                return Ok(response);
            }
            if pending.request.is_auth_endpoint() {
                return Ok(response);
            }
            let Some(stale) = token else {
                // Never had a token to renew; let the caller see the 401
                return Ok(response);
            };
            if !pending.can_replay() {
                warn!(path = %pending.request.path, "Rejected again after renewal; giving up");
                return Err(ApiError::ReplayExhausted);
            }

            let now = lifecycle.snapshot();
            if now.epoch != sent_under.epoch || !now.is_active() {
                debug!(path = %pending.request.path, "Session ended while request was in flight");
                return Err(ApiError::ConcurrentTeardown);
            }

            debug!(path = %pending.request.path, "Access token refused; waiting for renewal");
            match self.coordinator.renew_stale(&stale).await {
                Ok(_) => {
                    pending.retry_count += 1;
                    debug!(path = %pending.request.path, retry = pending.retry_count, "Replaying request");
                }
                Err(e @ RenewalError::Rejected(_)) => {
                    debug!(path = %pending.request.path, error = %e, "Renewal rejected");
                    return Err(ApiError::SessionTerminated);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::tests::credential;
    use crate::auth::session::{SessionLifecycle, SessionState, TerminationReason};
    use crate::auth::storage::MemoryStore;
    use crate::auth::CredentialStore;
    use crate::test_support::{ScriptedRenewalClient, TokenCheckingTransport};
    use futures::future::join_all;
    use std::time::Duration;

    fn setup(
        client: Arc<ScriptedRenewalClient>,
        transport: Arc<TokenCheckingTransport>,
    ) -> (ReactiveInterceptor, Arc<SingleFlightCoordinator>) {
        let coordinator = SingleFlightCoordinator::new(
            CredentialStore::new(Arc::new(MemoryStore::new())),
            client,
            Arc::new(SessionLifecycle::new()),
            Duration::from_secs(5),
        );
        (ReactiveInterceptor::new(transport, coordinator.clone()), coordinator)
    }

    #[tokio::test]
    async fn test_valid_token_passes_through() {
        let transport = TokenCheckingTransport::accepting(&["access-1"]);
        let client = ScriptedRenewalClient::new();
        let (interceptor, coordinator) = setup(client.clone(), transport.clone());
        coordinator.install(credential("1", 300));

        let response = interceptor.execute(ApiRequest::get("/orders")).await.unwrap();
        assert!(response.is_success());
        assert_eq!(client.calls(), 0);
        assert_eq!(transport.log(), vec![("/orders".to_string(), Some("access-1".to_string()))]);
    }

    #[tokio::test]
    async fn test_concurrent_401s_renew_once_and_replay_once_each() {
        let transport = TokenCheckingTransport::accepting(&["access-renewed-1"]);
        let client = ScriptedRenewalClient::gated();
        let (interceptor, coordinator) = setup(client.clone(), transport.clone());
        coordinator.install(credential("1", -1));

        let paths: Vec<String> = (0..20).map(|i| format!("/orders/{}", i)).collect();
        let requests = join_all(paths.iter().map(|p| interceptor.execute(ApiRequest::get(p.as_str()))));
        let release = async {
            while client.calls() == 0 {
                tokio::task::yield_now().await;
            }
            // Give every request time to hit its 401 and park
            while transport.log().len() < paths.len() {
                tokio::task::yield_now().await;
            }
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            client.release();
        };
        let (results, ()) = tokio::join!(requests, release);

        assert_eq!(client.calls(), 1);
        for result in results {
            let body: serde_json::Value = result.unwrap().json().unwrap();
            assert_eq!(body["token"], "access-renewed-1");
        }
        for path in &paths {
            // Original attempt plus exactly one replay
            assert_eq!(transport.sends_to(path), 2, "{}", path);
        }
    }

    #[tokio::test]
    async fn test_second_401_after_renewal_is_replay_exhausted() {
        let transport = TokenCheckingTransport::accepting(&["access-renewed-1"]);
        transport.reject_path("/admin/reports");
        let client = ScriptedRenewalClient::new();
        let (interceptor, coordinator) = setup(client.clone(), transport.clone());
        coordinator.install(credential("1", 300));

        let err = interceptor
            .execute(ApiRequest::get("/admin/reports"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::ReplayExhausted));
        assert_eq!(transport.sends_to("/admin/reports"), 2);
        assert_eq!(client.calls(), 1);
        // Not a session failure
        assert!(coordinator.lifecycle().is_active());
    }

    #[tokio::test]
    async fn test_rejected_renewal_surfaces_session_terminated() {
        let transport = TokenCheckingTransport::accepting(&[]);
        let client = ScriptedRenewalClient::new();
        client.push(Err(RenewalError::Rejected("revoked".into())));
        let (interceptor, coordinator) = setup(client.clone(), transport.clone());
        coordinator.install(credential("1", 300));

        let err = interceptor.execute(ApiRequest::get("/orders")).await.unwrap_err();
        assert!(matches!(err, ApiError::SessionTerminated));
        assert!(err.requires_login());
        assert_eq!(coordinator.lifecycle().state(), SessionState::Anonymous);
        assert!(coordinator.current().is_none());
        assert_eq!(transport.sends_to("/orders"), 1);
    }

    #[tokio::test]
    async fn test_unavailable_renewal_surfaces_immediately() {
        let transport = TokenCheckingTransport::accepting(&[]);
        let client = ScriptedRenewalClient::new();
        client.push(Err(RenewalError::Unavailable("503".into())));
        let (interceptor, coordinator) = setup(client.clone(), transport.clone());
        coordinator.install(credential("1", 300));

        let err = interceptor.execute(ApiRequest::get("/orders")).await.unwrap_err();
        assert!(matches!(err, ApiError::RenewalUnavailable(_)));
        assert_eq!(client.calls(), 1);
        assert!(coordinator.lifecycle().is_active());
    }

    #[tokio::test]
    async fn test_auth_endpoint_401_is_not_intercepted() {
        let transport = TokenCheckingTransport::accepting(&[]);
        let client = ScriptedRenewalClient::new();
        let (interceptor, coordinator) = setup(client.clone(), transport.clone());
        coordinator.install(credential("1", 300));

        let request = ApiRequest::get("/auth/refresh").as_auth_endpoint();
        let response = interceptor.execute(request).await.unwrap();
        assert!(response.is_auth_failure());
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_anonymous_401_is_returned_as_is() {
        let transport = TokenCheckingTransport::accepting(&[]);
        let client = ScriptedRenewalClient::new();
        let (interceptor, _coordinator) = setup(client.clone(), transport.clone());

        let response = interceptor.execute(ApiRequest::get("/catalog")).await.unwrap();
        assert!(response.is_auth_failure());
        assert_eq!(transport.log()[0].1, None);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_teardown_while_in_flight_is_concurrent_teardown() {
        let transport = TokenCheckingTransport::accepting(&[]);
        let client = ScriptedRenewalClient::new();
        let (interceptor, coordinator) = setup(client.clone(), transport.clone());
        coordinator.install(credential("1", 300));

        let request = interceptor.execute(ApiRequest::get("/orders"));
        let logout = async {
            // The transport yields once mid-request; log out in that window
            while transport.log().is_empty() {
                tokio::task::yield_now().await;
            }
            coordinator.terminate(None, TerminationReason::Logout);
        };
        let (result, ()) = tokio::join!(request, logout);

        assert!(matches!(result, Err(ApiError::ConcurrentTeardown)));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_logout_between_renewal_and_replay_is_concurrent_teardown() {
        let transport = TokenCheckingTransport::accepting(&["access-renewed-1"]);
        let client = ScriptedRenewalClient::new();
        let (interceptor, coordinator) = setup(client.clone(), transport.clone());
        let interceptor = Arc::new(interceptor);
        coordinator.install(credential("1", 300));
        let mut states = coordinator.lifecycle().watch();

        let request = tokio::spawn({
            let interceptor = Arc::clone(&interceptor);
            async move { interceptor.execute(ApiRequest::get("/orders")).await }
        });

        // The renewal task wakes us before it wakes the parked request
        while coordinator.access_token().as_deref() != Some("access-renewed-1") {
            states.changed().await.unwrap();
        }
        coordinator.terminate(None, TerminationReason::Logout);

        let result = request.await.unwrap();
        assert!(matches!(result, Err(ApiError::ConcurrentTeardown)));
        assert_eq!(transport.sends_to("/orders"), 1);
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn test_pending_request_replay_budget() {
        let mut pending = PendingRequest::new(ApiRequest::get("/orders"));
        assert!(pending.can_replay());
        pending.retry_count += 1;
        assert!(!pending.can_replay());
    }
}
