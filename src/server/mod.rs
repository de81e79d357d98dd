//! Aggregation service
//!
//! Accepts weight uploads, keeps versioned snapshots, and serves the
//! federated average back to clients.

pub mod auth;
pub mod cors;
pub mod error;
pub mod fedavg;
pub mod handlers;
pub mod rate_limit;
pub mod store;

pub use error::ServiceError;
pub use fedavg::federated_average;
pub use store::{Store, StoreImage, StoreLimits, WeightSnapshot};

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use rate_limit::RateLimiter;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<RwLock<Store>>,
    pub limiter: Arc<RateLimiter>,
    /// Generation of the last store image written to disk
    pub persisted: Arc<Mutex<u64>>,
    pub started: Instant,
}

impl ServerState {
    /// State with a store opened from the configured persistence file, if any
    pub fn new(config: ServerConfig) -> Result<Self> {
        let limits = StoreLimits::from(&config);
        let store = match &config.persistence_path {
            Some(path) => Store::open(path.clone(), limits)?,
            None => Store::new(limits),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Store) -> Self {
        let limiter = RateLimiter::new(config.rate_limit, Duration::from_secs(config.rate_window_secs));
        Self {
            config: Arc::new(config),
            store: Arc::new(RwLock::new(store)),
            limiter: Arc::new(limiter),
            persisted: Arc::new(Mutex::new(0)),
            started: Instant::now(),
        }
    }

    /// Write a store image off the request path
    pub fn persist_in_background(&self, image: StoreImage) {
        let persisted = self.persisted.clone();
        tokio::spawn(async move {
            if let Err(e) = write_if_newer(&persisted, image).await {
                warn!("Failed to persist store: {:#}", e);
            }
        });
    }
}

/// Write `image` unless a newer one already reached the disk
pub async fn write_if_newer(persisted: &Mutex<u64>, image: StoreImage) -> Result<bool> {
    let mut last = persisted.lock().await;
    if image.generation() <= *last {
        debug!("Skipping stale store image {}", image.generation());
        return Ok(false);
    }
    image.write().await?;
    *last = image.generation();
    Ok(true)
}

/// Build the service router
///
/// Layers, outermost first: tracing, preflight status, CORS, rate limiting,
/// auth, body limit.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/weights", post(handlers::upload_weights))
        .route("/weights/latest", get(handlers::latest_weights))
        .route("/telemetry", post(handlers::report_telemetry))
        .route("/health", get(handlers::health))
        .route("/stats/{client_id}", get(handlers::contribution_stats))
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_auth))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit::enforce))
        .layer(cors::layer(&state.config.cors_origins))
        .layer(middleware::from_fn(cors::preflight_no_content))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the service until Ctrl-C
pub async fn start(config: ServerConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid listen address")?;
    let state = ServerState::new(config)?;
    let app = router(state.clone());

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("     {}", crate::info());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Server binding to: {}", addr);
    if state.config.api_token.is_some() {
        println!("✓ Bearer token authentication enabled");
    } else {
        println!("⚠ No API token configured, serving loopback peers only");
    }
    println!(
        "✓ Rate limit: {} requests per {}s",
        state.config.rate_limit, state.config.rate_window_secs
    );
    match &state.config.persistence_path {
        Some(path) => println!("✓ Persisting store to {}", path.display()),
        None => println!("⚠ Store is in memory only"),
    }
    println!();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, persisting store");
    let image = state.store.read().await.image();
    match image {
        Ok(Some(image)) => {
            if let Err(e) = write_if_newer(&state.persisted, image).await {
                warn!("Failed to persist store on shutdown: {:#}", e);
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Failed to serialize store on shutdown: {:#}", e),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
