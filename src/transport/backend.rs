//! HTTP backends the transport client can run on
//!
//! The client only needs "send this request, give me status and body". Any
//! HTTP stack can be plugged in by implementing [`HttpBackend`]; production
//! uses [`ReqwestBackend`].

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use std::time::Duration;
use url::Url;

use super::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A single HTTP exchange, relative to the service base URL
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub bearer: Option<String>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(path: &str, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            path: path.to_string(),
            query: Vec::new(),
            body: None,
            bearer: None,
            timeout,
        }
    }

    pub fn post(path: &str, body: Vec<u8>, timeout: Duration) -> Self {
        Self {
            method: Method::Post,
            path: path.to_string(),
            query: Vec::new(),
            body: Some(body),
            bearer: None,
            timeout,
        }
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_bearer(mut self, token: Option<&str>) -> Self {
        self.bearer = token.map(|t| t.to_string());
        self
    }

    /// Path plus url-encoded query string
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish();
        format!("{}?{}", self.path, query)
    }
}

/// What came back. Non-2xx statuses are not errors at this level.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            body: value.to_string().into_bytes(),
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Minimal HTTP interface used by the transport client
///
/// Implementations must report transport-level failures as
/// [`TransportError::Unreachable`] or [`TransportError::Timeout`] and must
/// return every HTTP status as `Ok`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// `reqwest` powered backend
#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: Client,
    base_url: Url,
}

impl ReqwestBackend {
    pub fn new(endpoint: &str) -> Result<Self, TransportError> {
        let base_url = Url::parse(endpoint).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidEndpoint(format!("{} cannot be a base URL", endpoint)));
        }
        Ok(Self {
            client: Client::new(),
            base_url,
        })
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = self.url(&request.path)?;
        let mut builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };

        builder = builder.timeout(request.timeout).query(&request.query);
        if let Some(token) = &request.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(body) = request.body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, request.timeout))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(e, request.timeout))?
            .to_vec();

        Ok(HttpResponse {
            status,
            body,
            retry_after,
        })
    }
}

fn classify_reqwest_error(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Unreachable(error.to_string())
    }
}
