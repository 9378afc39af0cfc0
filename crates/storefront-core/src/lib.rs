//! Storefront core - API access layer with a self-renewing session.
//!
//! The interesting part of this crate is the session token lifecycle:
//! a short-lived access token is renewed proactively by a timer and
//! reactively when a request comes back `401`, with every concurrent
//! renewal trigger collapsed into one network call.
//!
//! - [`auth`]: credentials, storage, renewal coordination and the session state machine
//! - [`api`]: transport, the replaying interceptor and the typed API client
//! - [`config`]: persisted configuration and session tuning

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiError};
pub use auth::{Credential, SessionEvent, SessionManager, SessionState};
pub use config::Config;
