//! Scripted collaborators shared by the unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::Notify;

use crate::api::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::credentials::tests::credential;
use crate::auth::{Credential, RenewalClient, RenewalError};

/// Access lifetime of credentials handed out by [`ScriptedRenewalClient`]
pub(crate) const RENEWED_LIFETIME_SECS: i64 = 60;

/// Renewal client with scripted outcomes.
///
/// Unscripted calls succeed with `access-renewed-N` / `refresh-renewed-N`
/// where N is the call number. A gated client holds every call until
/// [`release`](Self::release) is called.
pub(crate) struct ScriptedRenewalClient {
    calls: AtomicUsize,
    outcomes: Mutex<VecDeque<Result<Credential, RenewalError>>>,
    refresh_tokens: Mutex<Vec<String>>,
    gate: Option<Notify>,
}

impl ScriptedRenewalClient {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub(crate) fn gated() -> Arc<Self> {
        Arc::new(Self::build(Some(Notify::new())))
    }

    fn build(gate: Option<Notify>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcomes: Mutex::new(VecDeque::new()),
            refresh_tokens: Mutex::new(Vec::new()),
            gate,
        }
    }

    pub(crate) fn push(&self, outcome: Result<Credential, RenewalError>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_tokens.lock().clone()
    }

    /// Let one gated call through
    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl RenewalClient for ScriptedRenewalClient {
    async fn renew(&self, current: &Credential) -> Result<Credential, RenewalError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.refresh_tokens.lock().push(current.refresh_token.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let scripted = self.outcomes.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(credential(&format!("renewed-{}", n), RENEWED_LIFETIME_SECS)))
    }
}

/// Backend stand-in that accepts a fixed set of access tokens.
///
/// Requests carrying an accepted token get `200` with the token echoed in the
/// body; anything else gets `401`. Paths in `always_unauthorized` get `401`
/// whatever the token.
pub(crate) struct TokenCheckingTransport {
    accepted: Mutex<HashSet<String>>,
    always_unauthorized: Mutex<HashSet<String>>,
    log: Mutex<Vec<(String, Option<String>)>>,
}

impl TokenCheckingTransport {
    pub(crate) fn accepting(tokens: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            accepted: Mutex::new(tokens.iter().map(|t| t.to_string()).collect()),
            always_unauthorized: Mutex::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn reject_path(&self, path: &str) {
        self.always_unauthorized.lock().insert(path.to_string());
    }

    /// `(path, token)` for every request sent, in order
    pub(crate) fn log(&self) -> Vec<(String, Option<String>)> {
        self.log.lock().clone()
    }

    pub(crate) fn sends_to(&self, path: &str) -> usize {
        self.log.lock().iter().filter(|(p, _)| p == path).count()
    }
}

#[async_trait]
impl Transport for TokenCheckingTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        self.log
            .lock()
            .push((request.path.clone(), access_token.map(str::to_string)));
        tokio::task::yield_now().await;

        let path_rejected = self.always_unauthorized.lock().contains(&request.path);
        let token_ok = access_token.is_some_and(|t| self.accepted.lock().contains(t));
        if token_ok && !path_rejected {
            let body = serde_json::json!({ "path": request.path, "token": access_token });
            Ok(ApiResponse::new(StatusCode::OK, body.to_string()))
        } else {
            Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, r#"{"error":"token expired"}"#))
        }
    }
}
