//! Login and token renewal calls against the auth endpoints.
//!
//! The renewal endpoint takes the current `{accessToken, refreshToken}` pair
//! and answers with a fresh credential, or with a structured failure that
//! tells a dead refresh token apart from a struggling backend. That split is
//! what [`RenewalError`] carries: `Rejected` ends the session, `Unavailable`
//! is worth retrying later.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Credential;
use crate::api::{ApiError, ApiRequest, Transport};

const LOGIN_PATH: &str = "/auth/login";
const RENEWAL_PATH: &str = "/auth/refresh";

/// Outcome of a failed renewal. Cloned out to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewalError {
    /// Refresh credential invalid, expired or revoked. Terminal.
    #[error("Renewal rejected: {0}")]
    Rejected(String),

    /// Network or server trouble. Retryable.
    #[error("Renewal service unavailable: {0}")]
    Unavailable(String),

    /// The session was torn down before the renewal could finish
    #[error("Session ended before renewal completed")]
    SessionEnded,
}

impl RenewalError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RenewalError::Rejected(_))
    }
}

#[async_trait]
pub trait RenewalClient: Send + Sync {
    /// Exchange the refresh token of `current` for a new credential.
    async fn renew(&self, current: &Credential) -> Result<Credential, RenewalError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenewalRequest<'a> {
    access_token: &'a str,
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Token payload shared by the login and renewal endpoints.
/// A renewal may omit the refresh pair, in which case the old one stays valid.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    access_expiry: DateTime<Utc>,
    refresh_token: Option<String>,
    refresh_expiry: Option<DateTime<Utc>>,
}

impl TokenResponse {
    fn into_credential(self, previous: Option<&Credential>) -> Option<Credential> {
        let (refresh_token, refresh_expiry) = match (self.refresh_token, self.refresh_expiry) {
            (Some(token), Some(expiry)) if !token.is_empty() => (token, expiry),
            _ => {
                let previous = previous?;
                (previous.refresh_token.clone(), previous.refresh_expiry)
            }
        };
        Some(Credential {
            access_token: self.access_token,
            access_expiry: self.access_expiry,
            refresh_token,
            refresh_expiry,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Decide whether a failed renewal response is terminal or transient.
fn classify_failure(status: StatusCode, body: &str) -> RenewalError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let detail = parsed
        .as_ref()
        .and_then(|b| b.message.clone().or_else(|| b.error.clone()))
        .unwrap_or_else(|| format!("Status {}: {}", status, ApiError::truncate_body(body)));

    match parsed.as_ref().and_then(|b| b.error.as_deref()) {
        Some("invalid_credential" | "invalid_grant" | "expired_token" | "revoked") => {
            RenewalError::Rejected(detail)
        }
        Some("service_unavailable" | "temporarily_unavailable") => RenewalError::Unavailable(detail),
        _ => match status.as_u16() {
            400 | 401 | 403 => RenewalError::Rejected(detail),
            _ => RenewalError::Unavailable(detail),
        },
    }
}

/// Client for the `/auth/*` endpoints, sending through a [`Transport`]
/// directly so these calls are never intercepted.
pub struct HttpAuthClient {
    transport: Arc<dyn Transport>,
}

impl HttpAuthClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Authenticate with username and password and return the first credential
    pub async fn login(&self, username: &str, password: &str) -> Result<Credential> {
        let request = ApiRequest::post(LOGIN_PATH, &LoginRequest { username, password })?
            .as_auth_endpoint();

        let response = self
            .transport
            .send(&request, None)
            .await
            .context("Failed to send authentication request")?
            .error_for_status()?;

        let tokens: TokenResponse = response.json().context("Failed to parse auth response")?;
        tokens
            .into_credential(None)
            .ok_or_else(|| anyhow::anyhow!("Auth response did not include a refresh token"))
    }
}

#[async_trait]
impl RenewalClient for HttpAuthClient {
    async fn renew(&self, current: &Credential) -> Result<Credential, RenewalError> {
        let body = RenewalRequest {
            access_token: &current.access_token,
            refresh_token: &current.refresh_token,
        };
        let request = ApiRequest::post(RENEWAL_PATH, &body)
            .map_err(|e| RenewalError::Unavailable(e.to_string()))?
            .as_auth_endpoint();

        let response = match self.transport.send(&request, None).await {
            Ok(response) => response,
            Err(e) => return Err(RenewalError::Unavailable(e.to_string())),
        };

        if !response.is_success() {
            let failure = classify_failure(response.status, &response.body);
            debug!(status = response.status.as_u16(), error = %failure, "Renewal endpoint refused");
            return Err(failure);
        }

        let tokens: TokenResponse = response
            .json()
            .map_err(|e| RenewalError::Unavailable(e.to_string()))?;
        tokens
            .into_credential(Some(current))
            .ok_or_else(|| RenewalError::Unavailable("Renewal response missing tokens".to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================
