//! Aggregation service behavior seen through the HTTP surface

mod common;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tower::ServiceExt;

use common::{client_config, server_state, RouterBackend, LOOPBACK, REMOTE};
use swarm_sync::config::ServerConfig;
use swarm_sync::protocol::UploadMetadata;
use swarm_sync::server::router;
use swarm_sync::transport::TransportClient;
use swarm_sync::weights::{checksum, Category, PackagedWeights, WeightEntry};
use swarm_sync::{TransportError, UploadOutcome};

fn tools(name: &str, rate: f64, sample_size: u64) -> PackagedWeights {
    let mut weights = PackagedWeights::default();
    weights.tools.insert(
        name.to_string(),
        WeightEntry::new(sample_size)
            .with_number("successRate", rate)
            .with_number("avgLatency", 0.2),
    );
    weights
}

fn metadata(client_id: &str) -> UploadMetadata {
    UploadMetadata {
        client_id: client_id.to_string(),
        sample_size: 0,
        timestamp: Utc::now(),
    }
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((LOOPBACK, 40_000))));
    request
}

fn get(uri: &str) -> Request<Body> {
    let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((LOOPBACK, 40_000))));
    request
}

/// Poll until the persisted store holds `snapshots` snapshots
async fn wait_for_store(path: &Path, snapshots: usize) -> bool {
    for _ in 0..100 {
        let written = std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
            .and_then(|store| store["snapshots"].as_array().map(Vec::len));
        if written == Some(snapshots) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_rate_limit_rejects_exactly_the_excess_request() {
    let app = router(server_state(ServerConfig {
        rate_limit: 5,
        ..ServerConfig::default()
    }));

    let responses = join_all((0..6).map(|_| app.clone().oneshot(get("/weights/latest")))).await;
    let statuses: Vec<StatusCode> = responses.into_iter().map(|r| r.unwrap().status()).collect();

    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 5);
    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::TOO_MANY_REQUESTS).count(), 1);
}

#[tokio::test]
async fn test_rate_limited_response_carries_retry_after() {
    let app = router(server_state(ServerConfig {
        rate_limit: 1,
        rate_window_secs: 30,
        ..ServerConfig::default()
    }));

    let first = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second.headers()[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=30).contains(&retry_after));
    assert_eq!(json_body(second).await["success"], false);
}

#[tokio::test]
async fn test_checksum_mismatch_is_rejected() {
    let state = server_state(ServerConfig::default());
    let app = router(state.clone());
    let weights = tools("Read", 0.8, 5);

    let body = json!({
        "weights": weights,
        "metadata": { "clientId": "client-a", "sampleSize": 5, "timestamp": Utc::now() },
        "checksum": "0".repeat(64),
    });
    let response = app.clone().oneshot(post_json("/weights", &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["success"], false);
    assert_eq!(state.store.read().await.snapshot_count(), 0);

    let body = json!({
        "weights": weights,
        "metadata": { "clientId": "client-a", "sampleSize": 5, "timestamp": Utc::now() },
        "checksum": checksum(&weights).unwrap(),
    });
    let response = app.oneshot(post_json("/weights", &body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["version"], "v1");
}

#[tokio::test]
async fn test_malformed_uploads_are_bad_requests() {
    let app = router(server_state(ServerConfig::default()));

    let missing_weights = json!({ "metadata": { "clientId": "x", "sampleSize": 1, "timestamp": Utc::now() } });
    let response = app.clone().oneshot(post_json("/weights", &missing_weights)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let empty = json!({
        "weights": PackagedWeights::default(),
        "metadata": { "clientId": "x", "sampleSize": 1, "timestamp": Utc::now() },
    });
    let response = app.clone().oneshot(post_json("/weights", &empty)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut not_json = post_json("/weights", &json!(null));
    *not_json.body_mut() = Body::from("{not json");
    let response = app.oneshot(not_json).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delta_since_previous_version() {
    let state = server_state(ServerConfig::default());
    let client = TransportClient::with_backend(RouterBackend::new(state), client_config()).unwrap();

    let v1 = client.upload_weights(&tools("Read", 0.8, 5), metadata("a")).await.unwrap();
    assert!(matches!(v1, UploadOutcome::Accepted { ref version, .. } if version == "v1"));

    let mut second = tools("Read", 0.4, 5);
    second
        .commands
        .insert("test".to_string(), WeightEntry::new(4).with_number("effectiveness", 0.9));
    client.upload_weights(&second, metadata("b")).await.unwrap();

    let latest = client.download_latest_weights(Some("v1"), Some("a")).await.unwrap();
    assert_eq!(latest.version.as_deref(), Some("v2"));
    assert!(!latest.up_to_date);
    let delta = latest.delta.expect("delta against v1");
    assert_eq!(delta.since, "v1");
    assert!(delta.category(Category::Commands).added.contains_key("test"));
    assert!(delta.category(Category::Tools).changed.contains_key("Read"));

    let current = client.download_latest_weights(Some("v2"), Some("a")).await.unwrap();
    assert!(current.up_to_date);

    let unknown = client.download_latest_weights(Some("v999"), None).await.unwrap();
    assert!(unknown.delta.is_none());
    assert!(unknown.weights.is_some());
}

#[tokio::test]
async fn test_remote_client_with_token() {
    let config = ServerConfig {
        api_token: Some("swarm-secret".to_string()),
        ..ServerConfig::default()
    };
    let state = server_state(config);

    let anonymous = TransportClient::with_backend(RouterBackend::from_peer(state.clone(), REMOTE), client_config()).unwrap();
    let err = anonymous
        .upload_weights(&tools("Read", 0.8, 5), metadata("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Status { status: 401, .. }));
    assert_eq!(anonymous.queue_len().await, 0);

    let mut config = client_config();
    config.api_token = Some("swarm-secret".to_string());
    let authed = TransportClient::with_backend(RouterBackend::from_peer(state, REMOTE), config).unwrap();
    let outcome = authed.upload_weights(&tools("Read", 0.8, 5), metadata("a")).await.unwrap();
    assert!(outcome.is_accepted());

    // health stays open
    assert!(anonymous.check_health().await.is_ok());
}

#[tokio::test]
async fn test_contribution_ranking() {
    let state = server_state(ServerConfig::default());
    let client = TransportClient::with_backend(RouterBackend::new(state), client_config()).unwrap();

    for (client_id, uploads) in [("alpha", 3), ("beta", 1), ("gamma", 3)] {
        for _ in 0..uploads {
            client.upload_weights(&tools("Read", 0.5, 3), metadata(client_id)).await.unwrap();
        }
    }

    let alpha = client.get_contribution_stats("alpha").await.unwrap();
    let gamma = client.get_contribution_stats("gamma").await.unwrap();
    let beta = client.get_contribution_stats("beta").await.unwrap();
    assert_eq!(alpha.rank, Some(1));
    assert_eq!(gamma.rank, Some(1));
    assert_eq!(beta.rank, Some(3));
    assert_eq!(beta.total_clients, 3);

    let nobody = client.get_contribution_stats("nobody").await.unwrap();
    assert_eq!(nobody.uploads, 0);
    assert_eq!(nobody.rank, None);

    let err = client.get_contribution_stats("../etc").await.unwrap_err();
    assert!(matches!(err, TransportError::Validation(_)));
}

#[tokio::test]
async fn test_persisted_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        persistence_path: Some(dir.path().join("store.json")),
        ..ServerConfig::default()
    };

    let state = server_state(config.clone());
    let client = TransportClient::with_backend(RouterBackend::new(state.clone()), client_config()).unwrap();
    client.upload_weights(&tools("Read", 0.8, 5), metadata("a")).await.unwrap();
    assert!(wait_for_store(config.persistence_path.as_deref().unwrap(), 1).await);

    let restarted = server_state(config);
    let client = TransportClient::with_backend(RouterBackend::new(restarted), client_config()).unwrap();
    let latest = client.download_latest_weights(None, None).await.unwrap();
    assert_eq!(latest.version.as_deref(), Some("v1"));

    let next = client.upload_weights(&tools("Read", 0.6, 5), metadata("b")).await.unwrap();
    assert!(matches!(next, UploadOutcome::Accepted { ref version, .. } if version == "v2"));
    tokio_test::assert_ok!(client.check_health().await);
}

#[tokio::test]
async fn test_oversized_sample_size_is_rejected() {
    let state = server_state(ServerConfig::default());
    let app = router(state.clone());

    let huge_entry = json!({
        "weights": { "tools": { "Read": { "sampleSize": u64::MAX, "successRate": 1.0 } } },
        "metadata": { "clientId": "mallory", "sampleSize": 5, "timestamp": Utc::now() },
    });
    let response = app.clone().oneshot(post_json("/weights", &huge_entry)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let huge_metadata = json!({
        "weights": tools("Read", 1.0, 5),
        "metadata": { "clientId": "mallory", "sampleSize": u64::MAX, "timestamp": Utc::now() },
    });
    let response = app.clone().oneshot(post_json("/weights", &huge_metadata)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.store.read().await.snapshot_count(), 0);

    let client = TransportClient::with_backend(RouterBackend::new(state), client_config()).unwrap();
    let v1 = client.upload_weights(&tools("Read", 0.8, 5), metadata("a")).await.unwrap();
    assert!(matches!(v1, UploadOutcome::Accepted { ref version, .. } if version == "v1"));
    let v2 = client.upload_weights(&tools("Read", 0.4, 5), metadata("b")).await.unwrap();
    assert!(matches!(v2, UploadOutcome::Accepted { ref version, .. } if version == "v2"));

    let latest = client.download_latest_weights(None, None).await.unwrap();
    let rate = latest.weights.unwrap().tools["Read"].number("successRate").unwrap();
    assert!((rate - 0.6).abs() < 1e-9);
}

#[tokio::test]
async fn test_out_of_range_fields_are_rejected() {
    let state = server_state(ServerConfig::default());
    let app = router(state.clone());

    let bad_ratio = json!({
        "weights": { "tools": { "Read": { "sampleSize": 5, "successRate": 42.0, "avgLatency": -7.5 } } },
        "metadata": { "clientId": "mallory", "sampleSize": 5, "timestamp": Utc::now() },
    });
    let response = app.clone().oneshot(post_json("/weights", &bad_ratio)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["success"], false);

    let negative_size = json!({
        "weights": { "teams": { "pair": { "sampleSize": 3, "effectiveness": 0.5, "optimalSize": -2.0 } } },
        "metadata": { "clientId": "mallory", "sampleSize": 3, "timestamp": Utc::now() },
    });
    let response = app.clone().oneshot(post_json("/weights", &negative_size)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.store.read().await.snapshot_count(), 0);

    let team_size = json!({
        "weights": { "teams": { "pair": { "sampleSize": 3, "effectiveness": 0.5, "optimalSize": 4.0 } } },
        "metadata": { "clientId": "a", "sampleSize": 3, "timestamp": Utc::now() },
    });
    let response = app.oneshot(post_json("/weights", &team_size)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_uploads_reach_disk_in_the_background() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let state = server_state(ServerConfig {
        persistence_path: Some(path.clone()),
        ..ServerConfig::default()
    });
    let client = TransportClient::with_backend(RouterBackend::new(state), client_config()).unwrap();
    client.upload_weights(&tools("Read", 0.8, 5), metadata("a")).await.unwrap();

    assert!(wait_for_store(&path, 1).await, "store was not written to {}", path.display());
}
