//! Authentication module for the storefront session.
//!
//! This module provides:
//! - `CredentialStore`: the current access/refresh pair, persisted via a `KeyValueStore`
//! - `SingleFlightCoordinator`: collapses concurrent renewal triggers into one call
//! - `ProactiveScheduler`: renews ahead of access-token expiry
//! - `SessionLifecycle`: the Authenticated / Renewing / Terminated / Anonymous machine
//! - `SessionManager`: the facade applications hold on to
//!
//! Access tokens are short-lived; the refresh token is only ever sent to the
//! renewal endpoint.

pub mod coordinator;
pub mod credentials;
pub mod manager;
pub mod renewal;
pub mod scheduler;
pub mod session;
pub mod storage;

pub use coordinator::{RenewalAttempt, SingleFlightCoordinator};
pub use credentials::{Credential, CredentialStore};
pub use manager::{open_storage, SessionInfo, SessionManager};
pub use renewal::{HttpAuthClient, RenewalClient, RenewalError};
pub use scheduler::ProactiveScheduler;
pub use session::{SessionEvent, SessionLifecycle, SessionSnapshot, SessionState, TerminationReason};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};
