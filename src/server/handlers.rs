//! Endpoint handlers

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::error::ServiceError;
use super::ServerState;
use crate::protocol::{
    ContributionStats, HealthReport, LatestWeightsResponse, MemoryUsage, TelemetryReport, TelemetryResponse,
    UploadRequest, UploadResponse,
};
use crate::weights::{checksum, diff, MAX_SAMPLE_SIZE};

/// Longest client id accepted
const MAX_CLIENT_ID_LEN: usize = 128;

/// Query of `GET /weights/latest`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestQuery {
    pub since: Option<String>,
    pub client_id: Option<String>,
}

/// `POST /weights`
pub async fn upload_weights(
    State(state): State<ServerState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<UploadResponse>, ServiceError> {
    let body = read_body(body)?;
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("Malformed JSON: {}", e)))?;
    if !value.get("weights").is_some_and(|w| w.is_object()) {
        return Err(ServiceError::BadRequest("Missing weights".to_string()));
    }
    let upload: UploadRequest = serde_json::from_value(value)
        .map_err(|e| ServiceError::BadRequest(format!("Invalid upload: {}", e)))?;

    let client_id = upload.metadata.client_id.trim();
    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(ServiceError::BadRequest("Invalid clientId".to_string()));
    }
    if upload.weights.is_empty() {
        return Err(ServiceError::BadRequest("Weights are empty".to_string()));
    }
    if upload.metadata.sample_size > MAX_SAMPLE_SIZE {
        return Err(ServiceError::BadRequest(format!(
            "sampleSize {} exceeds {}",
            upload.metadata.sample_size, MAX_SAMPLE_SIZE
        )));
    }
    upload
        .weights
        .validate()
        .map_err(|e| ServiceError::BadRequest(e.to_string()))?;

    let digest = checksum(&upload.weights)?;
    if let Some(claimed) = &upload.checksum {
        if !claimed.eq_ignore_ascii_case(&digest) {
            debug!("Checksum mismatch from {}", client_id);
            return Err(ServiceError::ChecksumMismatch);
        }
    }

    let (snapshot, image) = {
        let mut store = state.store.write().await;
        let snapshot = store.accept_upload(upload.weights, &upload.metadata, digest)?;
        let image = store.image().unwrap_or_else(|e| {
            warn!("Failed to serialize store: {:#}", e);
            None
        });
        (snapshot, image)
    };
    if let Some(image) = image {
        state.persist_in_background(image);
    }
    info!(
        "Accepted {} from {} ({} samples)",
        snapshot.version, snapshot.metadata.client_id, snapshot.metadata.sample_size
    );

    Ok(Json(UploadResponse {
        success: true,
        version: snapshot.version,
        timestamp: snapshot.metadata.timestamp,
    }))
}

/// `GET /weights/latest`
pub async fn latest_weights(
    State(state): State<ServerState>,
    Query(query): Query<LatestQuery>,
) -> Result<Json<LatestWeightsResponse>, ServiceError> {
    let client_id = query
        .client_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_CLIENT_ID_LEN);

    let mut store = state.store.write().await;
    if let Some(client_id) = client_id {
        store.record_download(client_id);
    }

    let Some(latest) = store.latest() else {
        return Ok(Json(LatestWeightsResponse {
            success: true,
            timestamp: Utc::now(),
            ..LatestWeightsResponse::default()
        }));
    };

    let delta = query
        .since
        .as_deref()
        .and_then(|since| store.global_at(since))
        .map(|old| diff(&old.version, &old.weights, &latest.weights));
    let up_to_date = query.since.as_deref() == Some(latest.version.as_str());

    Ok(Json(LatestWeightsResponse {
        success: true,
        version: Some(latest.version.clone()),
        weights: Some(latest.weights.clone()),
        checksum: Some(latest.checksum.clone()),
        delta,
        up_to_date,
        contributors: latest.contributors,
        timestamp: Utc::now(),
    }))
}

/// `POST /telemetry`
pub async fn report_telemetry(
    State(state): State<ServerState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<TelemetryResponse>, ServiceError> {
    let body = read_body(body)?;
    let report: TelemetryReport = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("Invalid telemetry: {}", e)))?;

    let stored = state.store.write().await.record_telemetry(report.stats);
    Ok(Json(TelemetryResponse { success: true, stored }))
}

/// `GET /health`
pub async fn health(State(state): State<ServerState>) -> Json<HealthReport> {
    let store = state.store.read().await;
    Json(HealthReport {
        status: "ok".to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        clients: store.client_count(),
        version: store.latest().map(|g| g.version.clone()),
        telemetry_count: store.telemetry_count(),
        memory: MemoryUsage {
            rss_bytes: resident_set_size(),
            snapshots: store.snapshot_count(),
            telemetry_records: store.telemetry_count(),
        },
        service_version: crate::VERSION.to_string(),
    })
}

/// `GET /stats/{client_id}`
pub async fn contribution_stats(
    State(state): State<ServerState>,
    Path(client_id): Path<String>,
) -> Json<ContributionStats> {
    Json(state.store.read().await.contribution_stats(&client_id))
}

pub async fn not_found() -> ServiceError {
    ServiceError::NotFound
}

fn read_body(body: Result<Bytes, BytesRejection>) -> Result<Bytes, ServiceError> {
    body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServiceError::PayloadTooLarge
        } else {
            ServiceError::BadRequest(rejection.body_text())
        }
    })
}

/// Resident memory from procfs, where available
fn resident_set_size() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

/// `VmRSS` from `/proc/self/status`, in bytes
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut parts = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") | None => value.checked_mul(1024),
        Some(_) => None,
    }
}
