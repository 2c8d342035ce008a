//! Client for the Bleemeo REST API
//!
//! This module provides:
//! - The `RawClient` trait used by every synchronizer (single request,
//!   raw body upload, paginated listing)
//! - Typed API errors with not-found and unsupported-endpoint detection
//! - A reqwest-backed implementation with JWT authentication

pub mod http;

pub use http::{ClientConfig, Credentials, HttpClient, HttpClientBuilder, HttpClientFactory};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Decoded response of a single request
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

/// Non-success answer from the API
#[derive(Debug, Clone, PartialEq, Error)]
#[error("API returned status {status_code} for {final_url}: {}", truncate(.body, 200))]
pub struct ApiError {
    pub status_code: u16,
    pub content_type: String,
    pub final_url: String,
    pub body: String,
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        self.status_code == 404
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    /// Older API versions redirect unknown endpoints to the HTML login page.
    pub fn is_unsupported_endpoint(&self) -> bool {
        self.content_type.starts_with("text/html") && self.final_url.contains("login")
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid URL: {0}")]
    Url(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api(e) if e.is_not_found())
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            ClientError::Api(e) => Some(e),
            _ => None,
        }
    }
}

/// Whether an error chain contains a 404 from the API.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<ClientError>())
        .any(ClientError::is_not_found)
}

/// The API error in an error chain, if any.
pub fn api_error(err: &anyhow::Error) -> Option<&ApiError> {
    err.chain().find_map(|e| match e.downcast_ref::<ClientError>() {
        Some(ClientError::Api(api)) => Some(api),
        _ => e.downcast_ref::<ApiError>(),
    })
}

/// Whether an error chain contains an authentication failure.
pub fn is_authentication_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<ClientError>())
        .any(|e| matches!(e, ClientError::Authentication(_)))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Low level access to the API, substituted by an in-memory fake in tests
#[async_trait]
pub trait RawClient: Send + Sync {
    /// Perform one request. `path` is relative to the API base (`v1/agent/`).
    async fn do_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Response, ClientError>;

    /// POST a pre-built body, used for multipart uploads.
    async fn do_with_body(
        &self,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<u16, ClientError>;

    /// List every record of a resource, following pagination.
    async fn iter(&self, resource: &str, params: &[(&str, &str)]) -> Result<Vec<Value>, ClientError>;
}

/// Typed helpers over `RawClient`
#[async_trait]
pub trait RawClientExt: RawClient {
    async fn do_json<T: DeserializeOwned + Send>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<T, ClientError> {
        let response = self.do_request(method, path, params, body).await?;
        serde_json::from_value(response.body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn iter_as<T: DeserializeOwned + Send>(
        &self,
        resource: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>, ClientError> {
        self.iter(resource, params)
            .await?
            .into_iter()
            .map(|raw| serde_json::from_value(raw).map_err(|e| ClientError::Decode(e.to_string())))
            .collect()
    }
}

impl<C: RawClient + ?Sized> RawClientExt for C {}

/// Builds authenticated clients once credentials are known
pub trait ClientFactory: Send + Sync {
    /// Client authenticating as a registered agent.
    fn authenticated(&self, agent_id: &str, password: &str) -> Result<Arc<dyn RawClient>>;

    /// Client authenticating with the account registration key.
    fn registration(&self, account_id: &str, registration_key: &str) -> Result<Arc<dyn RawClient>>;
}
