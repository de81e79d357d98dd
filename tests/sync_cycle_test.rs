//! End-to-end sync cycles against the in-process aggregation service

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{client_config, server_state, RouterBackend};
use swarm_sync::config::ServerConfig;
use swarm_sync::sync::{StaticPatterns, SyncFiles, SyncOrchestrator};
use swarm_sync::transport::TransportClient;
use swarm_sync::weights::{LocalPattern, MergeRatio};
use swarm_sync::UploadOutcome;

fn orchestrator(backend: RouterBackend, patterns: Vec<LocalPattern>) -> SyncOrchestrator<RouterBackend> {
    let transport = TransportClient::with_backend(backend, client_config()).unwrap();
    SyncOrchestrator::new(transport, Arc::new(StaticPatterns(patterns)), MergeRatio::default(), None).unwrap()
}

#[tokio::test]
async fn test_full_cycle_against_fresh_service() {
    let state = server_state(ServerConfig::default());
    let sync = orchestrator(
        RouterBackend::new(state.clone()),
        vec![LocalPattern::tool("Read", 0.8, 120.0, 0.6, 5)],
    );

    let outcome = sync.force_sync().await;
    let report = outcome.report().expect("cycle ran");
    assert!(report.is_clean(), "errors: {:?}", report.errors);
    match &report.upload {
        Some(UploadOutcome::Accepted { version, .. }) => assert_eq!(version, "v1"),
        other => panic!("unexpected upload outcome: {:?}", other),
    }
    assert_eq!(report.version.as_deref(), Some("v1"));

    let merged = sync.merged_weights().await.unwrap();
    let rate = merged.tools["Read"].number("successRate").unwrap();
    assert!((rate - 0.8).abs() < 1e-9);

    let client_state = sync.state().await;
    assert_eq!(client_state.current_version.as_deref(), Some("v1"));
    assert_eq!(client_state.total_uploads, 1);
    assert_eq!(client_state.total_downloads, 1);

    let stats = sync.transport().get_contribution_stats(&client_state.client_id).await.unwrap();
    assert_eq!(stats.uploads, 1);
    assert_eq!(stats.downloads, 1);
    assert_eq!(stats.rank, Some(1));

    // sync telemetry lands after the download
    assert_eq!(state.store.read().await.telemetry_count(), 1);
}

#[tokio::test]
async fn test_two_clients_converge_on_weighted_average() {
    let state = server_state(ServerConfig::default());
    let first = orchestrator(
        RouterBackend::new(state.clone()),
        vec![LocalPattern::tool("Bash", 1.0, 50.0, 0.9, 3)],
    );
    let second = orchestrator(
        RouterBackend::new(state.clone()),
        vec![LocalPattern::tool("Bash", 0.6, 50.0, 0.9, 9)],
    );

    first.force_sync().await;
    let report = second.force_sync().await;
    let report = report.report().unwrap();
    assert_eq!(report.version.as_deref(), Some("v2"));

    let health = second.transport().check_health().await.unwrap();
    assert_eq!(health.clients, 2);
    assert_eq!(health.version.as_deref(), Some("v2"));

    let latest = second.transport().download_latest_weights(None, None).await.unwrap();
    assert_eq!(latest.contributors, 2);
    let global = latest.weights.unwrap();
    let rate = global.tools["Bash"].number("successRate").unwrap();
    assert!((rate - 0.7).abs() < 1e-9, "got {}", rate);
    assert_eq!(global.tools["Bash"].sample_size, 12);

    // second client merged 0.3 local + 0.7 global
    let merged = second.merged_weights().await.unwrap();
    let merged_rate = merged.tools["Bash"].number("successRate").unwrap();
    assert!((merged_rate - (0.3 * 0.6 + 0.7 * 0.7)).abs() < 1e-9);
}

#[tokio::test]
async fn test_session_hooks_split_the_cycle() {
    let state = server_state(ServerConfig::default());
    let sync = orchestrator(
        RouterBackend::new(state.clone()),
        vec![LocalPattern::tool("Edit", 0.9, 80.0, 0.7, 4)],
    );

    // nothing published yet
    sync.on_session_start().await;
    assert!(sync.state().await.current_version.is_none());

    sync.on_session_end().await;
    assert_eq!(state.store.read().await.snapshot_count(), 1);

    sync.on_session_start().await;
    assert_eq!(sync.state().await.current_version.as_deref(), Some("v1"));
    assert_eq!(sync.merged_patterns().await.len(), 1);
}

#[tokio::test]
async fn test_offline_uploads_survive_restart_and_flush() {
    let dir = tempfile::tempdir().unwrap();
    let files = SyncFiles::in_dir(dir.path());
    let state = server_state(ServerConfig::default());
    let patterns = vec![LocalPattern::tool("Grep", 0.75, 200.0, 0.5, 6)];

    let config = || {
        let mut config = client_config();
        config.queue_path = Some(files.offline_queue.clone());
        config
    };

    // first run: service down
    let backend = RouterBackend::new(state.clone());
    backend.online().store(false, Ordering::SeqCst);
    let transport = TransportClient::with_backend(backend, config()).unwrap();
    let offline = SyncOrchestrator::new(
        transport,
        Arc::new(StaticPatterns(patterns.clone())),
        MergeRatio::default(),
        Some(files.clone()),
    )
    .unwrap();

    let report = offline.force_sync().await;
    let report = report.report().unwrap();
    assert!(matches!(report.upload, Some(UploadOutcome::Queued { queue_len: 1 })));
    assert!(!report.is_clean());
    let client_id = offline.client_id().await;
    offline.stop().await;
    drop(offline);

    // second run: service back, same data directory
    let transport = TransportClient::with_backend(RouterBackend::new(state.clone()), config()).unwrap();
    assert_eq!(transport.queue_len().await, 1);
    let online = SyncOrchestrator::new(
        transport,
        Arc::new(StaticPatterns(patterns)),
        MergeRatio::default(),
        Some(files.clone()),
    )
    .unwrap();
    assert_eq!(online.client_id().await, client_id);

    let report = online.force_sync().await;
    let report = report.report().unwrap();
    assert!(report.is_clean(), "errors: {:?}", report.errors);
    assert_eq!(report.flushed, 1);
    assert_eq!(report.version.as_deref(), Some("v2"));
    assert_eq!(online.transport().queue_len().await, 0);
    assert_eq!(online.state().await.pending_uploads, 0);

    let stats = state.store.read().await.contribution_stats(&client_id);
    assert_eq!(stats.uploads, 2);
    assert!(files.merged_weights.exists());
}
