//! swarm-sync - federated pattern sharing client and aggregation service

use clap::Parser;
use swarm_sync::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // WARN by default, INFO while serving; RUST_LOG directives take precedence
    let level = if cli.command.is_serve() {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    cli::run(cli).await
}
