//! Request/response types and the transport seam.
//!
//! The gateway never talks to the network directly: it hands prepared
//! [`ApiRequest`]s to a [`Transport`]. [`HttpTransport`] is the production
//! implementation over `reqwest`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, SessionError};

/// Header carrying the bearer token.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Header carrying the device identifier.
pub const DEVICE_ID_HEADER: &str = "Device-Id";

/// An outbound API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the API base URL, starting with `/`.
    pub path: String,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Optional JSON body.
    pub body: Option<Value>,
    retried: bool,
}

impl ApiRequest {
    /// Creates a request with no headers and no body.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
            retried: false,
        }
    }

    /// Creates a `GET` request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Creates a `POST` request.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns a header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Returns `true` once the request has been re-issued after a renewal.
    #[must_use]
    pub const fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    pub(crate) fn set_bearer(&mut self, token: &str) {
        self.headers
            .insert(AUTHORIZATION_HEADER.to_string(), format!("Bearer {token}"));
    }
}

/// A response as seen by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Decoded body; `Value::Null` when empty, a string when not JSON.
    pub body: Value,
}

impl ApiResponse {
    /// Creates a response.
    #[must_use]
    pub const fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Deserializes the body.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidResponse` if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| SessionError::invalid_response(path, e.to_string()))
    }

    /// Returns the `message` field of an error body, or the body itself when
    /// it is a plain string.
    #[must_use]
    pub fn error_message(&self) -> String {
        match &self.body {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .or_else(|| map.get("error"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        }
    }
}

/// Sends prepared requests to the API.
///
/// Implementations return any HTTP status as an [`ApiResponse`] and reserve
/// `Err` for transport-level failures.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one request.
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// [`Transport`] over HTTP using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Creates a transport for the configured base URL and timeout.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NetworkError` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        debug!(method = %request.method, path = %request.path, status, "HTTP response");

        Ok(ApiResponse { status, body })
    }
}
