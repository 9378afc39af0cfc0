//! REST API access module for the storefront backend.
//!
//! This module provides:
//! - `Transport` / `HttpTransport`: raw request sending with bearer tokens
//! - `ReactiveInterceptor`: renews and replays requests refused with `401`
//! - `ApiClient`: typed JSON helpers on top of the interceptor
//!
//! Business endpoints (orders, catalog, payments) are plain paths passed to
//! `ApiClient`; nothing here is specific to any of them.

pub mod client;
pub mod error;
pub mod interceptor;
pub mod transport;

pub use client::ApiClient;
pub use error::ApiError;
pub use interceptor::{PendingRequest, ReactiveInterceptor};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
