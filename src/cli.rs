//! CLI interface for swarm-sync

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ClientConfig, Config, ServerConfig};
use crate::sync::{PatternProvider, SyncOrchestrator, SyncOutcome};
use crate::transport::{TransportClient, UploadOutcome};
use crate::weights::LocalPattern;

#[derive(Parser, Debug)]
#[command(name = "swarm-sync")]
#[command(about = "Federated sharing of anonymized usage statistics", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, env = "SWARM_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the aggregation service
    Serve {
        /// Host to bind to
        #[arg(long, env = "SWARM_SYNC_HOST")]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long, env = "SWARM_SYNC_PORT")]
        port: Option<u16>,
        /// Bearer token clients must present
        #[arg(long, env = "SWARM_SYNC_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Allowed CORS origins, comma separated
        #[arg(long, env = "SWARM_SYNC_CORS_ORIGINS", value_delimiter = ',')]
        cors_origins: Option<Vec<String>>,
        /// Persist the store to this JSON file
        #[arg(long, env = "SWARM_SYNC_PERSIST")]
        persist: Option<PathBuf>,
        /// Requests per client IP per window
        #[arg(long, env = "SWARM_SYNC_RATE_LIMIT")]
        rate_limit: Option<usize>,
        /// Rate limit window in seconds
        #[arg(long, env = "SWARM_SYNC_RATE_WINDOW")]
        rate_window: Option<u64>,
        /// Snapshots averaged into the global model
        #[arg(long, env = "SWARM_SYNC_FEDAVG_WINDOW")]
        fedavg_window: Option<usize>,
        /// Maximum request body in bytes
        #[arg(long, env = "SWARM_SYNC_MAX_UPLOAD_BYTES")]
        max_upload_bytes: Option<usize>,
    },
    /// Probe a running service
    Health {
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Show contribution stats for a client (this installation by default)
    Stats {
        client_id: Option<String>,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Run one full sync cycle with patterns read from a JSON file
    Sync {
        /// JSON array of local patterns
        #[arg(long)]
        patterns: PathBuf,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Debug, Default)]
pub struct RemoteArgs {
    /// Service base URL
    #[arg(long, env = "SWARM_SYNC_ENDPOINT")]
    pub endpoint: Option<String>,
    /// Bearer token
    #[arg(long, env = "SWARM_SYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl Commands {
    pub fn is_serve(&self) -> bool {
        matches!(self, Commands::Serve { .. })
    }
}

impl RemoteArgs {
    fn apply(&self, client: &mut ClientConfig) {
        if let Some(endpoint) = &self.endpoint {
            client.transport.endpoint = endpoint.clone();
        }
        if let Some(token) = &self.token {
            client.transport.api_token = Some(token.clone());
        }
    }
}

/// Patterns loaded from a JSON file on every cycle
struct FilePatterns(PathBuf);

#[async_trait]
impl PatternProvider for FilePatterns {
    async fn local_patterns(&self) -> Result<Vec<LocalPattern>> {
        let content = tokio::fs::read_to_string(&self.0)
            .await
            .with_context(|| format!("Failed to read {}", self.0.display()))?;
        serde_json::from_str(&content).context("Failed to parse patterns")
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Serve {
            host,
            port,
            token,
            cors_origins,
            persist,
            rate_limit,
            rate_window,
            fedavg_window,
            max_upload_bytes,
        } => {
            let server = &mut config.server;
            if let Some(host) = host {
                server.host = host;
            }
            if let Some(port) = port {
                server.port = port;
            }
            if token.is_some() {
                server.api_token = token;
            }
            if let Some(origins) = cors_origins {
                server.cors_origins = origins;
            }
            if persist.is_some() {
                server.persistence_path = persist;
            }
            if let Some(limit) = rate_limit {
                server.rate_limit = limit;
            }
            if let Some(window) = rate_window {
                server.rate_window_secs = window;
            }
            if let Some(window) = fedavg_window {
                server.fedavg_window = window;
            }
            if let Some(max) = max_upload_bytes {
                server.max_upload_bytes = max;
            }
            validate_server(&config.server)?;
            crate::server::start(config.server).await?;
        }
        Commands::Health { remote } => {
            remote.apply(&mut config.client);
            let client = TransportClient::new(config.client.transport.clone())?;
            let health = client.check_health().await?;
            println!("Service:     {} ({})", health.status, config.client.transport.endpoint);
            println!("Version:     {}", health.version.as_deref().unwrap_or("none yet"));
            println!("Uptime:      {}s", health.uptime_secs);
            println!("Clients:     {}", health.clients);
            println!("Snapshots:   {}", health.memory.snapshots);
            println!("Telemetry:   {}", health.telemetry_count);
            if let Some(rss) = health.memory.rss_bytes {
                println!("Memory:      {:.1} MiB", rss as f64 / (1024.0 * 1024.0));
            }
        }
        Commands::Stats { client_id, remote } => {
            remote.apply(&mut config.client);
            let client_id = match client_id {
                Some(id) => id,
                None => {
                    let files = crate::sync::SyncFiles::in_dir(&config.client.data_dir()?);
                    files.load_state()?.client_id
                }
            };
            let client = TransportClient::new(config.client.transport.clone())?;
            let stats = client.get_contribution_stats(&client_id).await?;
            println!("Client:      {}", stats.client_id);
            println!("Uploads:     {}", stats.uploads);
            println!("Downloads:   {}", stats.downloads);
            match stats.rank {
                Some(rank) => println!("Rank:        {} of {}", rank, stats.total_clients),
                None => println!("Rank:        unranked ({} clients)", stats.total_clients),
            }
        }
        Commands::Sync { patterns, remote } => {
            remote.apply(&mut config.client);
            let provider = Arc::new(FilePatterns(patterns));
            let orchestrator = SyncOrchestrator::from_config(&config.client, provider)?;
            match orchestrator.force_sync().await {
                SyncOutcome::Completed(report) => {
                    match &report.upload {
                        Some(UploadOutcome::Accepted { version, .. }) => println!("✓ Uploaded as {}", version),
                        Some(UploadOutcome::Queued { queue_len }) => {
                            println!("⚠ Service unreachable, upload queued ({} pending)", queue_len)
                        }
                        None => println!("No eligible patterns to upload"),
                    }
                    if report.flushed > 0 {
                        println!("✓ Flushed {} queued uploads", report.flushed);
                    }
                    if let Some(version) = &report.version {
                        println!("✓ Merged global {} ({} entries)", version, report.merged_entries);
                    }
                    for error in &report.errors {
                        println!("✗ {}", error);
                    }
                }
                SyncOutcome::AlreadyInProgress => println!("Sync already in progress"),
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<()> {
    if server.rate_limit == 0 {
        anyhow::bail!("rate limit must be at least 1");
    }
    if server.rate_window_secs == 0 {
        anyhow::bail!("rate window must be at least 1 second");
    }
    if server.max_upload_bytes == 0 {
        anyhow::bail!("max upload bytes must be positive");
    }
    Ok(())
}
