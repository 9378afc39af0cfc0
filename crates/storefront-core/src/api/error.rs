use thiserror::Error;

use crate::auth::RenewalError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session terminated - please log in again")]
    SessionTerminated,

    #[error("Request rejected again after a successful token renewal")]
    ReplayExhausted,

    #[error("Session ended while the request was in flight")]
    ConcurrentTeardown,

    #[error("Token renewal unavailable: {0}")]
    RenewalUnavailable(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True when the caller has to log in again before retrying
    pub fn requires_login(&self) -> bool {
        matches!(self, ApiError::SessionTerminated | ApiError::ConcurrentTeardown)
    }
}

impl From<RenewalError> for ApiError {
    fn from(e: RenewalError) -> Self {
        match e {
            RenewalError::Rejected(_) => ApiError::SessionTerminated,
            RenewalError::Unavailable(msg) => ApiError::RenewalUnavailable(msg),
            RenewalError::SessionEnded => ApiError::ConcurrentTeardown,
        }
    }
}
