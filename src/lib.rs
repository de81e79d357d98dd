//! Swarm Sync - federated sharing of anonymized usage statistics
//!
//! Many offline-first installations contribute normalized, scrubbed
//! statistics to one aggregation service and receive back a sample-size
//! weighted average of everyone's contributions.
//!
//! - [`weights`]: packaging local patterns into shareable weights, merging
//!   and diffing them
//! - [`transport`]: the HTTP client with retries and an offline queue
//! - [`sync`]: the orchestrator driving flush, upload, download and merge
//! - [`server`]: the axum aggregation service and federated averaging
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use swarm_sync::config::Config;
//! use swarm_sync::sync::{StaticPatterns, SyncOrchestrator};
//! use swarm_sync::weights::LocalPattern;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let patterns = StaticPatterns(vec![LocalPattern::tool("Read", 0.8, 120.0, 0.6, 5)]);
//!     let sync = SyncOrchestrator::from_config(&config.client, Arc::new(patterns))?;
//!     sync.on_session_start().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod protocol;
pub mod server;
pub mod sync;
pub mod transport;
pub mod weights;

pub use config::Config;

pub use sync::{PatternProvider, SyncInterval, SyncOrchestrator, SyncOutcome, SyncReport};

pub use transport::{TransportClient, TransportConfig, TransportError, UploadOutcome};

pub use weights::{merge, package, unpack, LocalPattern, MergeRatio, PackagedWeights};

pub use server::{federated_average, router, start as start_server, ServerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - federated pattern sharing", NAME, VERSION)
}
