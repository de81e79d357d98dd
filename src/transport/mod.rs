//! Client side of the swarm protocol
//!
//! Uploads scrubbed weights, downloads the global model, and keeps uploads
//! that could not reach the service in an offline queue until the next
//! flush.

pub mod backend;
pub mod error;
pub mod privacy;
pub mod queue;
pub mod retry;

pub use backend::{HttpBackend, HttpRequest, HttpResponse, Method, ReqwestBackend};
pub use error::TransportError;
pub use privacy::{DefaultScrubber, NoiseInjector, PiiScrubber};
pub use queue::{OfflineQueue, QueueEntry, DEFAULT_QUEUE_CAPACITY};
pub use retry::RetryPolicy;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::{
    ContributionStats, ErrorBody, HealthReport, LatestWeightsResponse, TelemetryReport, TelemetryResponse,
    UploadMetadata, UploadRequest, UploadResponse,
};
use crate::weights::{checksum, PackagedWeights};

/// Default upload ceiling, matching the service body limit
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Base URL of the aggregation service
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Where the offline queue is persisted. In memory when unset.
    #[serde(default)]
    pub queue_path: Option<PathBuf>,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:3800".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_health_timeout_secs() -> u64 {
    10
}

fn default_max_upload_bytes() -> usize {
    DEFAULT_MAX_UPLOAD_BYTES
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            retry: RetryPolicy::default(),
            max_upload_bytes: default_max_upload_bytes(),
            queue_capacity: default_queue_capacity(),
            queue_path: None,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

/// Result of an upload that did not fail outright
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// The service stored a new snapshot
    Accepted { version: String, timestamp: DateTime<Utc> },
    /// The service was unreachable; the payload waits in the offline queue
    Queued { queue_len: usize },
}

impl UploadOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, UploadOutcome::Accepted { .. })
    }
}

/// Summary of an offline queue replay
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub flushed: usize,
    pub remaining: usize,
    pub errors: Vec<String>,
}

pub struct TransportClient<B: HttpBackend = ReqwestBackend> {
    backend: B,
    config: TransportConfig,
    scrubber: Arc<dyn PiiScrubber>,
    noise: Option<Arc<dyn NoiseInjector>>,
    queue: Mutex<OfflineQueue>,
}

impl TransportClient<ReqwestBackend> {
    /// Client talking HTTP to `config.endpoint`
    pub fn new(config: TransportConfig) -> anyhow::Result<Self> {
        let backend = ReqwestBackend::new(&config.endpoint)?;
        Self::with_backend(backend, config)
    }
}

impl<B: HttpBackend> TransportClient<B> {
    pub fn with_backend(backend: B, config: TransportConfig) -> anyhow::Result<Self> {
        let queue = match &config.queue_path {
            Some(path) => OfflineQueue::load(path.clone(), config.queue_capacity)?,
            None => OfflineQueue::in_memory(config.queue_capacity),
        };
        if !queue.is_empty() {
            info!("Loaded {} pending uploads from the offline queue", queue.len());
        }

        Ok(Self {
            backend,
            config,
            scrubber: Arc::new(DefaultScrubber),
            noise: None,
            queue: Mutex::new(queue),
        })
    }

    pub fn with_scrubber(mut self, scrubber: Arc<dyn PiiScrubber>) -> Self {
        self.scrubber = scrubber;
        self
    }

    pub fn with_noise(mut self, noise: Arc<dyn NoiseInjector>) -> Self {
        self.noise = Some(noise);
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Scrub, perturb, checksum and send local weights
    ///
    /// Oversized payloads are rejected before any network activity. When
    /// the service cannot be reached after all retries the prepared payload
    /// is queued and `UploadOutcome::Queued` is returned.
    pub async fn upload_weights(
        &self,
        weights: &PackagedWeights,
        mut metadata: UploadMetadata,
    ) -> Result<UploadOutcome, TransportError> {
        let raw_size = serde_json::to_vec(weights)?.len();
        if raw_size > self.config.max_upload_bytes {
            return Err(TransportError::PayloadTooLarge {
                size: raw_size,
                limit: self.config.max_upload_bytes,
            });
        }

        let mut prepared = self.scrubber.scrub(weights.clone());
        if let Some(noise) = &self.noise {
            prepared = noise.inject(prepared);
        }
        let digest = checksum(&prepared)?;
        if metadata.sample_size == 0 {
            metadata.sample_size = prepared.total_sample_size();
        }

        let request = UploadRequest {
            weights: prepared,
            metadata,
            checksum: Some(digest.clone()),
        };
        let body = serde_json::to_vec(&request)?;
        if body.len() > self.config.max_upload_bytes {
            return Err(TransportError::PayloadTooLarge {
                size: body.len(),
                limit: self.config.max_upload_bytes,
            });
        }

        match self.send_upload(body).await {
            Ok(response) => {
                info!("Uploaded {} weight entries as {}", request.weights.len(), response.version);
                Ok(UploadOutcome::Accepted {
                    version: response.version,
                    timestamp: response.timestamp,
                })
            }
            Err(e) if e.is_connectivity() => {
                let queue_len = self.enqueue(QueueEntry::upload(&request, digest)).await;
                warn!("Service unreachable ({}), upload queued ({} pending)", e, queue_len);
                Ok(UploadOutcome::Queued { queue_len })
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch the global model, verifying its checksum when one is sent
    pub async fn download_latest_weights(
        &self,
        since: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<LatestWeightsResponse, TransportError> {
        let mut request = HttpRequest::get("/weights/latest", self.config.request_timeout());
        if let Some(since) = since {
            request = request.with_query("since", since);
        }
        if let Some(client_id) = client_id {
            request = request.with_query("clientId", client_id);
        }

        let response: LatestWeightsResponse = self.call_with_retry("download", request).await?;
        if let (Some(weights), Some(expected)) = (&response.weights, &response.checksum) {
            let actual = checksum(weights)?;
            if &actual != expected {
                warn!("Discarding downloaded weights: checksum mismatch");
                return Err(TransportError::Integrity {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        debug!(
            "Downloaded global weights {:?} ({} contributors)",
            response.version, response.contributors
        );
        Ok(response)
    }

    /// Send anonymous counters. Failures are logged and reported as `false`.
    pub async fn report_telemetry(&self, report: &TelemetryReport) -> bool {
        let body = match serde_json::to_vec(report) {
            Ok(body) => body,
            Err(e) => {
                debug!("Telemetry not serializable: {}", e);
                return false;
            }
        };
        let request = HttpRequest::post("/telemetry", body, self.config.request_timeout());
        match self.call_with_retry::<TelemetryResponse>("telemetry", request).await {
            Ok(response) => response.success,
            Err(e) => {
                debug!("Telemetry report dropped: {}", e);
                false
            }
        }
    }

    /// Single-shot health probe with the short timeout
    pub async fn check_health(&self) -> Result<HealthReport, TransportError> {
        let request = HttpRequest::get("/health", self.config.health_timeout());
        self.call(request).await
    }

    pub async fn get_contribution_stats(&self, client_id: &str) -> Result<ContributionStats, TransportError> {
        if client_id.is_empty()
            || !client_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(TransportError::Validation(format!("invalid client id: {:?}", client_id)));
        }
        let request = HttpRequest::get(&format!("/stats/{}", client_id), self.config.request_timeout());
        self.call_with_retry("stats", request).await
    }

    /// Replay queued uploads oldest first
    ///
    /// Stops at the first connectivity failure, leaving that entry and
    /// everything after it queued. Entries the service refuses are dropped
    /// and reported in `errors`.
    pub async fn flush_offline_queue(&self) -> FlushReport {
        let pending = self.queue.lock().await.take_all();
        if pending.is_empty() {
            return FlushReport::default();
        }

        let mut report = FlushReport::default();
        let mut undelivered = Vec::new();
        let mut entries = pending.into_iter();

        while let Some(entry) = entries.next() {
            let body = match serde_json::to_vec(&entry.to_request()) {
                Ok(body) => body,
                Err(e) => {
                    report.errors.push(format!("unserializable entry: {}", e));
                    continue;
                }
            };
            match self.send_upload(body).await {
                Ok(response) => {
                    debug!("Flushed queued upload as {}", response.version);
                    report.flushed += 1;
                }
                Err(e) if e.is_connectivity() => {
                    undelivered.push(entry);
                    undelivered.extend(entries);
                    break;
                }
                Err(e) => {
                    warn!("Dropping queued upload from {}: {}", entry.queued_at, e);
                    report.errors.push(e.to_string());
                }
            }
        }

        let mut queue = self.queue.lock().await;
        queue.restore_front(undelivered);
        if let Err(e) = queue.persist() {
            warn!("Failed to persist offline queue: {:#}", e);
        }
        report.remaining = queue.len();

        if report.flushed > 0 || !report.errors.is_empty() {
            info!(
                "Offline queue flush: {} sent, {} remaining, {} dropped",
                report.flushed,
                report.remaining,
                report.errors.len()
            );
        }
        report
    }

    async fn enqueue(&self, entry: QueueEntry) -> usize {
        let mut queue = self.queue.lock().await;
        queue.push(entry);
        if let Err(e) = queue.persist() {
            warn!("Failed to persist offline queue: {:#}", e);
        }
        queue.len()
    }

    async fn send_upload(&self, body: Vec<u8>) -> Result<UploadResponse, TransportError> {
        let request = HttpRequest::post("/weights", body, self.config.request_timeout());
        self.call_with_retry("upload", request).await
    }

    async fn call_with_retry<T: DeserializeOwned>(
        &self,
        label: &str,
        request: HttpRequest,
    ) -> Result<T, TransportError> {
        retry::with_retry(&self.config.retry, label, || self.call(request.clone())).await
    }

    async fn call<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T, TransportError> {
        let request = request.with_bearer(self.config.api_token.as_deref());
        let response = self.backend.execute(request).await?;
        if !response.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&response.body)
                .map(|body| body.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&response.body).into_owned());
            return Err(TransportError::Status {
                status: response.status,
                message,
                retry_after: response.retry_after,
            });
        }
        Ok(serde_json::from_slice(&response.body)?)
    }
}
