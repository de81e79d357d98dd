//! Shared helpers: a transport backend that drives the service router
//! in-process instead of over a socket

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request};
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use swarm_sync::config::ServerConfig;
use swarm_sync::server::{router, ServerState};
use swarm_sync::transport::{HttpBackend, HttpRequest, HttpResponse, Method, RetryPolicy, TransportError};
use swarm_sync::TransportConfig;

pub const LOOPBACK: [u8; 4] = [127, 0, 0, 1];
pub const REMOTE: [u8; 4] = [203, 0, 113, 7];

/// Routes transport requests straight into an axum router
#[derive(Clone)]
pub struct RouterBackend {
    app: Router,
    peer: SocketAddr,
    online: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl RouterBackend {
    pub fn new(state: ServerState) -> Self {
        Self::from_peer(state, LOOPBACK)
    }

    pub fn from_peer(state: ServerState, peer: [u8; 4]) -> Self {
        Self {
            app: router(state),
            peer: SocketAddr::from((peer, 41_000)),
            online: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared switch; while false every request fails as unreachable
    pub fn online(&self) -> Arc<AtomicBool> {
        self.online.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpBackend for RouterBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("connection refused".to_string()));
        }

        let method = match request.method {
            Method::Get => "GET",
            Method::Post => "POST",
        };
        let mut builder = Request::builder().method(method).uri(request.path_and_query());
        if let Some(token) = &request.bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match request.body {
            Some(bytes) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let mut http_request = builder
            .body(body)
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        http_request.extensions_mut().insert(ConnectInfo(self.peer));

        let response = self
            .app
            .clone()
            .oneshot(http_request)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
            retry_after,
        })
    }
}

pub fn server_state(config: ServerConfig) -> ServerState {
    ServerState::new(config).unwrap()
}

/// Client config with retries turned off so failures surface immediately
pub fn client_config() -> TransportConfig {
    TransportConfig {
        retry: RetryPolicy::none(),
        ..TransportConfig::default()
    }
}
