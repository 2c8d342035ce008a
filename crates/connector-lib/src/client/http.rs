//! reqwest implementation of the API client
//!
//! - JWT bearer authentication, refreshed once on a 401
//! - Basic authentication for agent registration
//! - Pagination through the `next` link of list responses, refusing loops
//! - Short timeout for single requests, longer one for listings

use super::{ApiError, ClientError, ClientFactory, RawClient, Response};
use crate::observability::SyncMetrics;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// Domain appended to agent and account identifiers to build usernames.
pub const USERNAME_DOMAIN: &str = "bleemeo.com";

/// A listing with more pages is considered broken
const MAX_PAGES: usize = 10_000;

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API base URL (e.g., "https://api.bleemeo.com/")
    pub api_base: String,
    /// Timeout of a single request
    pub request_timeout: Duration,
    /// Timeout of each page of a listing
    pub iter_timeout: Duration,
    /// Page size requested on listings
    pub page_size: usize,
    /// User agent sent with every request
    pub user_agent: String,
    /// Accept invalid TLS certificates
    pub insecure_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.bleemeo.com/".to_string(),
            request_timeout: Duration::from_secs(10),
            iter_timeout: Duration::from_secs(60),
            page_size: 2500,
            user_agent: format!("monitoring-agent/{}", env!("CARGO_PKG_VERSION")),
            insecure_tls: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Exchanged for a JWT on `v1/jwt-auth/`
    Jwt { username: String, password: String },
    /// Sent on every request
    Basic { username: String, password: String },
}

/// Builder for [`HttpClient`]
#[derive(Debug, Default)]
pub struct HttpClientBuilder {
    config: Option<ClientConfig>,
    api_base: Option<String>,
    credentials: Option<Credentials>,
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        let mut config = self.config.unwrap_or_default();
        if let Some(api_base) = self.api_base {
            config.api_base = api_base;
        }

        if config.api_base.is_empty() {
            return Err(anyhow!("api_base is required"));
        }

        let credentials = self
            .credentials
            .ok_or_else(|| anyhow!("credentials are required"))?;

        // Url::join drops the last path segment unless the base ends with '/'
        let mut api_base = config.api_base.clone();
        if !api_base.ends_with('/') {
            api_base.push('/');
        }
        let base = Url::parse(&api_base)
            .with_context(|| format!("Invalid API base URL {:?}", config.api_base))?;

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(HttpClient {
            http,
            base,
            config,
            credentials,
            token: Mutex::new(None),
            metrics: SyncMetrics::new(),
        })
    }
}

/// API client over HTTP
pub struct HttpClient {
    http: reqwest::Client,
    base: Url,
    config: ClientConfig,
    credentials: Credentials,
    token: Mutex<Option<String>>,
    metrics: SyncMetrics,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, ClientError> {
        let mut url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::Url(format!("{}: {}", path, e)))?;

        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }

        Ok(url)
    }

    fn is_jwt(&self) -> bool {
        matches!(self.credentials, Credentials::Jwt { .. })
    }

    /// Current JWT, authenticating when none is known.
    async fn token(&self) -> Result<String, ClientError> {
        let mut token = self.token.lock().await;
        if let Some(existing) = token.as_ref() {
            return Ok(existing.clone());
        }

        let fresh = self.authenticate().await?;
        *token = Some(fresh.clone());
        Ok(fresh)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn authenticate(&self) -> Result<String, ClientError> {
        let Credentials::Jwt { username, password } = &self.credentials else {
            return Err(ClientError::Authentication(
                "JWT requested without JWT credentials".to_string(),
            ));
        };

        let url = self.url("v1/jwt-auth/", &[])?;
        debug!(username = %username, "Requesting a new JWT");

        let response = self
            .http
            .post(url)
            .timeout(self.config.request_timeout)
            .header(ACCEPT, "application/json")
            .json(&json!({"username": username, "password": password}))
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, self.config.request_timeout))?;

        let status = response.status();
        self.metrics.inc_api_request("POST", status.as_u16());

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST {
            return Err(ClientError::Authentication(format!(
                "the API refused the credentials of {} ({})",
                username, status
            )));
        }

        let decoded = decode(response).await?;
        decoded
            .body
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Decode("JWT response has no token".to_string()))
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        body: RequestBody<'_>,
        timeout: Duration,
    ) -> Result<reqwest::Response, ClientError> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .timeout(timeout)
            .header(ACCEPT, "application/json");

        request = match &self.credentials {
            Credentials::Basic { username, password } => request.basic_auth(username, Some(password)),
            Credentials::Jwt { .. } => request.bearer_auth(self.token().await?),
        };

        request = match body {
            RequestBody::None => request,
            RequestBody::Json(value) => request.json(value),
            RequestBody::Raw { content_type, data } => {
                request.header(CONTENT_TYPE, content_type).body(data.clone())
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, timeout))?;

        self.metrics
            .inc_api_request(method.as_str(), response.status().as_u16());

        Ok(response)
    }

    /// Send a request, re-authenticating once when the token was refused.
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: RequestBody<'_>,
        timeout: Duration,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self.send_once(&method, &url, body, timeout).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if !self.is_jwt() {
            return Err(ClientError::Authentication(format!(
                "{} {} answered 401",
                method, url
            )));
        }

        debug!(url = %url, "JWT refused, authenticating again");
        self.invalidate_token().await;

        let response = self.send_once(&method, &url, body, timeout).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Authentication(format!(
                "{} {} answered 401 after re-authentication",
                method, url
            )));
        }

        Ok(response)
    }

    fn map_transport_error(&self, err: reqwest::Error, timeout: Duration) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout(timeout)
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

#[derive(Clone, Copy)]
enum RequestBody<'a> {
    None,
    Json(&'a Value),
    Raw { content_type: &'a str, data: &'a Bytes },
}

/// Turn an HTTP response into a decoded JSON body or an [`ApiError`].
async fn decode(response: reqwest::Response) -> Result<Response, ClientError> {
    let status = response.status();
    let final_url = response.url().to_string();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    let api_error = |bytes: &[u8]| ApiError {
        status_code: status.as_u16(),
        content_type: content_type.clone(),
        final_url: final_url.clone(),
        body: String::from_utf8_lossy(bytes).into_owned(),
    };

    if !status.is_success() {
        return Err(api_error(&bytes).into());
    }

    if bytes.is_empty() || status == StatusCode::NO_CONTENT {
        return Ok(Response {
            status: status.as_u16(),
            body: Value::Null,
        });
    }

    match serde_json::from_slice(&bytes) {
        Ok(body) => Ok(Response {
            status: status.as_u16(),
            body,
        }),
        Err(_) if !content_type.contains("json") => Err(api_error(&bytes).into()),
        Err(e) => Err(ClientError::Decode(e.to_string())),
    }
}

#[async_trait]
impl RawClient for HttpClient {
    async fn do_request(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Response, ClientError> {
        let url = self.url(path, params)?;
        let body = match &body {
            Some(value) => RequestBody::Json(value),
            None => RequestBody::None,
        };

        let response = self
            .send(method, url, body, self.config.request_timeout)
            .await?;

        decode(response).await
    }

    async fn do_with_body(
        &self,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<u16, ClientError> {
        let url = self.url(path, &[])?;
        let body = Bytes::from(body);
        let response = self
            .send(
                Method::POST,
                url,
                RequestBody::Raw {
                    content_type,
                    data: &body,
                },
                self.config.iter_timeout,
            )
            .await?;

        let status = response.status().as_u16();
        decode(response).await?;

        Ok(status)
    }

    async fn iter(&self, resource: &str, params: &[(&str, &str)]) -> Result<Vec<Value>, ClientError> {
        let page_size = self.config.page_size.to_string();
        let mut all_params: Vec<(&str, &str)> = params.to_vec();
        if !params.iter().any(|(k, _)| *k == "page_size") {
            all_params.push(("page_size", &page_size));
        }

        let mut next = Some(self.url(&format!("v1/{}/", resource), &all_params)?);
        let mut records = Vec::new();
        let mut seen: HashSet<Url> = HashSet::new();

        while let Some(url) = next.take() {
            if seen.len() >= MAX_PAGES {
                return Err(ClientError::Decode(format!(
                    "listing of {} exceeds {} pages",
                    resource, MAX_PAGES
                )));
            }
            if !seen.insert(url.clone()) {
                return Err(ClientError::Decode(format!(
                    "listing of {} loops back to {}",
                    resource, url
                )));
            }

            let response = self
                .send(Method::GET, url, RequestBody::None, self.config.iter_timeout)
                .await?;
            let page = decode(response).await?;

            match page.body {
                Value::Array(items) => records.extend(items),
                Value::Object(mut object) => {
                    if let Some(Value::Array(items)) = object.remove("results") {
                        records.extend(items);
                    }

                    if let Some(Value::String(link)) = object.remove("next") {
                        if !link.is_empty() {
                            let url = Url::parse(&link)
                                .map_err(|e| ClientError::Url(format!("{}: {}", link, e)))?;
                            next = Some(url);
                        }
                    }
                }
                other => {
                    return Err(ClientError::Decode(format!(
                        "unexpected listing of {}: {}",
                        resource, other
                    )))
                }
            }
        }

        debug!(resource = %resource, pages = seen.len(), records = records.len(), "Listed resource");

        Ok(records)
    }
}

/// Creates reqwest clients sharing one configuration
#[derive(Debug, Clone, Default)]
pub struct HttpClientFactory {
    config: ClientConfig,
}

impl HttpClientFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for HttpClientFactory {
    fn authenticated(&self, agent_id: &str, password: &str) -> Result<Arc<dyn RawClient>> {
        let client = HttpClient::builder()
            .config(self.config.clone())
            .credentials(Credentials::Jwt {
                username: format!("{}@{}", agent_id, USERNAME_DOMAIN),
                password: password.to_string(),
            })
            .build()?;

        Ok(Arc::new(client))
    }

    fn registration(&self, account_id: &str, registration_key: &str) -> Result<Arc<dyn RawClient>> {
        let client = HttpClient::builder()
            .config(self.config.clone())
            .credentials(Credentials::Basic {
                username: format!("{}@{}", account_id, USERNAME_DOMAIN),
                password: registration_key.to_string(),
            })
            .build()?;

        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn jwt_client(server: &mockito::ServerGuard) -> HttpClient {
        HttpClient::builder()
            .api_base(server.url())
            .credentials(Credentials::Jwt {
                username: "agent-1@bleemeo.com".to_string(),
                password: "secret".to_string(),
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_credentials() {
        let err = HttpClient::builder()
            .api_base("https://api.example.com/")
            .build()
            .err()
            .unwrap();

        assert!(err.to_string().contains("credentials are required"));
    }

    #[test]
    fn test_builder_rejects_empty_base() {
        let err = HttpClient::builder()
            .api_base("")
            .credentials(Credentials::Basic {
                username: "a".to_string(),
                password: "b".to_string(),
            })
            .build()
            .err()
            .unwrap();

        assert!(err.to_string().contains("api_base is required"));
    }

    #[tokio::test]
    async fn test_request_uses_jwt() {
        let mut server = mockito::Server::new_async().await;
        let auth = server
            .mock("POST", "/v1/jwt-auth/")
            .match_body(Matcher::Json(json!({"username": "agent-1@bleemeo.com", "password": "secret"})))
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "abc"}"#)
            .expect(1)
            .create_async()
            .await;
        let agent = server
            .mock("GET", "/v1/agent/agent-1/")
            .match_header("authorization", "Bearer abc")
            .match_query(Matcher::UrlEncoded("fields".into(), "id,fqdn".into()))
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "agent-1", "fqdn": "web.example.com"}"#)
            .expect(2)
            .create_async()
            .await;

        let client = jwt_client(&server);
        for _ in 0..2 {
            let response = client
                .do_request(Method::GET, "v1/agent/agent-1/", &[("fields", "id,fqdn")], None)
                .await
                .unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.body["fqdn"], "web.example.com");
        }

        auth.assert_async().await;
        agent.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_once() {
        let mut server = mockito::Server::new_async().await;
        let auth = server
            .mock("POST", "/v1/jwt-auth/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "fresh"}"#)
            .expect(1)
            .create_async()
            .await;
        let stale = server
            .mock("GET", "/v1/info/")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", "/v1/info/")
            .match_header("authorization", "Bearer fresh")
            .with_header("content-type", "application/json")
            .with_body(r#"{"maintenance": false}"#)
            .expect(1)
            .create_async()
            .await;

        let client = jwt_client(&server);
        *client.token.lock().await = Some("stale".to_string());

        let response = client
            .do_request(Method::GET, "v1/info/", &[], None)
            .await
            .unwrap();
        assert_eq!(response.body["maintenance"], false);

        auth.assert_async().await;
        stale.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_an_authentication_error() {
        let mut server = mockito::Server::new_async().await;
        let auth = server
            .mock("POST", "/v1/jwt-auth/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "abc"}"#)
            .expect(2)
            .create_async()
            .await;
        let info = server
            .mock("GET", "/v1/info/")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let client = jwt_client(&server);
        let err = client
            .do_request(Method::GET, "v1/info/", &[], None)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Authentication(_)));
        auth.assert_async().await;
        info.assert_async().await;
    }

    #[tokio::test]
    async fn test_iter_follows_next_links() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/jwt-auth/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "abc"}"#)
            .create_async()
            .await;
        let first = server
            .mock("GET", "/v1/metric/")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("active".into(), "True".into()),
                Matcher::UrlEncoded("page_size".into(), "2500".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "next": format!("{}/v1/metric/?active=True&page=2", server.url()),
                    "results": [{"id": "1"}, {"id": "2"}]
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/v1/metric/")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_header("content-type", "application/json")
            .with_body(r#"{"next": null, "results": [{"id": "3"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = jwt_client(&server);
        let records = client.iter("metric", &[("active", "True")]).await.unwrap();

        let ids: Vec<&str> = records.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_iter_stops_on_looping_next_link() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/jwt-auth/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "abc"}"#)
            .create_async()
            .await;
        let looping = format!("{}/v1/service/?page=2", server.url());
        let first = server
            .mock("GET", "/v1/service/")
            .match_query(Matcher::UrlEncoded("page_size".into(), "2500".into()))
            .with_header("content-type", "application/json")
            .with_body(json!({"next": looping, "results": [{"id": "1"}]}).to_string())
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/v1/service/")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_header("content-type", "application/json")
            .with_body(json!({"next": looping, "results": [{"id": "2"}]}).to_string())
            .expect(1)
            .create_async()
            .await;

        let client = jwt_client(&server);
        let err = client.iter("service", &[]).await.unwrap_err();

        assert!(matches!(err, ClientError::Decode(ref message) if message.contains("loops back")));
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_body_survives_token_refresh() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/jwt-auth/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "fresh"}"#)
            .create_async()
            .await;
        let stale = server
            .mock("POST", "/v1/gloutondiagnostic/")
            .match_header("authorization", "Bearer stale")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("POST", "/v1/gloutondiagnostic/")
            .match_header("authorization", "Bearer fresh")
            .match_header("content-type", "multipart/form-data; boundary=xyz")
            .match_body("--xyz\r\narchive\r\n--xyz--\r\n")
            .with_status(201)
            .expect(1)
            .create_async()
            .await;

        let client = jwt_client(&server);
        *client.token.lock().await = Some("stale".to_string());

        let status = client
            .do_with_body(
                "v1/gloutondiagnostic/",
                "multipart/form-data; boundary=xyz",
                b"--xyz\r\narchive\r\n--xyz--\r\n".to_vec(),
            )
            .await
            .unwrap();

        assert_eq!(status, 201);
        stale.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_page_is_reported_as_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/jwt-auth/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "abc"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/agentconfig/")
            .match_query(Matcher::Any)
            .with_status(302)
            .with_header("location", "/login/?next=/v1/agentconfig/")
            .create_async()
            .await;
        server
            .mock("GET", "/login/")
            .match_query(Matcher::Any)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<html><body>Login</body></html>")
            .create_async()
            .await;

        let client = jwt_client(&server);
        let err = client.iter("agentconfig", &[]).await.unwrap_err();

        let api = err.api_error().unwrap();
        assert!(api.is_unsupported_endpoint());
    }

    #[tokio::test]
    async fn test_basic_auth_unauthorized_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let register = server
            .mock("POST", "/v1/agent/")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let factory = HttpClientFactory::new(ClientConfig {
            api_base: server.url(),
            ..Default::default()
        });
        let client = factory.registration("account-1", "key").unwrap();
        let err = client
            .do_request(Method::POST, "v1/agent/", &[], Some(json!({"account": "account-1"})))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Authentication(_)));
        register.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_keeps_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/jwt-auth/")
            .with_header("content-type", "application/json")
            .with_body(r#"{"token": "abc"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/v1/metric/")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"label": ["This metric is not whitelisted for this agent"]}"#)
            .create_async()
            .await;

        let client = jwt_client(&server);
        let err = client
            .do_request(Method::POST, "v1/metric/", &[("fields", "id")], Some(json!({})))
            .await
            .unwrap_err();

        let api = err.api_error().unwrap();
        assert_eq!(api.status_code, 400);
        assert!(api.body.contains("not whitelisted"));
    }
}
