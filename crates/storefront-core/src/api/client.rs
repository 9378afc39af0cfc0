//! API client for the storefront REST backend.
//!
//! `ApiClient` is the typed surface the rest of the application uses. Every
//! call goes through the [`ReactiveInterceptor`], so callers never handle
//! token expiry themselves; they only see session-level errors such as
//! [`ApiError::SessionTerminated`] when the user has to log in again.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use super::{ApiError, ApiRequest, ApiResponse, ReactiveInterceptor};

/// Clone is cheap - the interceptor is shared.
#[derive(Clone)]
pub struct ApiClient {
    interceptor: Arc<ReactiveInterceptor>,
}

impl ApiClient {
    pub fn new(interceptor: ReactiveInterceptor) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    /// Send a request and return the raw response, whatever its status
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.interceptor.execute(request).await
    }

    async fn send_checked(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.send(request).await?.error_for_status()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_checked(ApiRequest::get(path)).await?.json()
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_checked(ApiRequest::post(path, body)?).await?.json()
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_checked(ApiRequest::put(path, body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send_checked(ApiRequest::delete(path)).await?;
        Ok(())
    }
}
