//! Wire format shared by the transport client and the aggregation service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::weights::{PackagedWeights, WeightsDelta};

/// Metadata sent alongside an upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    /// Anonymous per-installation identifier
    pub client_id: String,
    #[serde(default)]
    pub sample_size: u64,
    pub timestamp: DateTime<Utc>,
}

/// `POST /weights` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub weights: PackagedWeights,
    pub metadata: UploadMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// `POST /weights` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// `GET /weights/latest` response
///
/// `weights` is absent until the first contribution has been accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestWeightsResponse {
    pub success: bool,
    pub version: Option<String>,
    pub weights: Option<PackagedWeights>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<WeightsDelta>,
    #[serde(default)]
    pub up_to_date: bool,
    #[serde(default)]
    pub contributors: usize,
    pub timestamp: DateTime<Utc>,
}

/// `POST /telemetry` body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Anonymous numeric counters only
    pub stats: BTreeMap<String, f64>,
}

impl TelemetryReport {
    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.stats.insert(name.to_string(), value);
        self
    }
}

/// `POST /telemetry` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryResponse {
    pub success: bool,
    pub stored: usize,
}

/// Process memory figures reported by `/health`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    /// Resident set size, when the platform exposes it
    pub rss_bytes: Option<u64>,
    pub snapshots: usize,
    pub telemetry_records: usize,
}

/// `GET /health` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub uptime_secs: u64,
    pub clients: usize,
    pub version: Option<String>,
    pub telemetry_count: usize,
    pub memory: MemoryUsage,
    pub service_version: String,
}

/// `GET /stats/{clientId}` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionStats {
    pub client_id: String,
    pub uploads: u64,
    pub downloads: u64,
    /// 1-based position by upload count, absent for unknown clients
    pub rank: Option<usize>,
    pub total_clients: usize,
    pub last_upload: Option<DateTime<Utc>>,
    pub last_download: Option<DateTime<Utc>>,
}

/// Body of every error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}
