//! Sync lifecycle
//!
//! The orchestrator sequences a cycle as flush, package, upload, download,
//! merge, persist. Session hooks run the halves of that cycle, and an
//! optional timer runs full cycles on an hourly or daily cadence.
//!
//! Only one cycle runs at a time. A caller that arrives while another cycle
//! is in flight gets [`SyncOutcome::AlreadyInProgress`] right away.

pub mod schedule;
pub mod state;

pub use schedule::SyncInterval;
pub use state::{SyncFiles, SyncState};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::protocol::{TelemetryReport, UploadMetadata};
use crate::transport::{HttpBackend, ReqwestBackend, TransportClient, UploadOutcome};
use crate::weights::{merge, package, unpack, LocalPattern, MergeRatio, Package, PackagedWeights};

/// Source of local statistics, supplied by the host's learning pipeline
#[async_trait]
pub trait PatternProvider: Send + Sync {
    async fn local_patterns(&self) -> Result<Vec<LocalPattern>>;
}

/// Fixed set of patterns
#[derive(Debug, Clone, Default)]
pub struct StaticPatterns(pub Vec<LocalPattern>);

#[async_trait]
impl PatternProvider for StaticPatterns {
    async fn local_patterns(&self) -> Result<Vec<LocalPattern>> {
        Ok(self.0.clone())
    }
}

/// What a sync pass did
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub flushed: usize,
    pub upload: Option<UploadOutcome>,
    pub packaged: usize,
    pub skipped: usize,
    /// Global version merged during this pass
    pub version: Option<String>,
    pub merged_entries: usize,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Anonymous counters sent to the service after a full cycle
    pub fn telemetry(&self) -> TelemetryReport {
        let (uploaded, queued) = match &self.upload {
            Some(UploadOutcome::Accepted { .. }) => (1.0, 0.0),
            Some(UploadOutcome::Queued { .. }) => (0.0, 1.0),
            None => (0.0, 0.0),
        };
        TelemetryReport::default()
            .with("flushed", self.flushed as f64)
            .with("uploaded", uploaded)
            .with("queued", queued)
            .with("patterns", self.packaged as f64)
            .with("skipped", self.skipped as f64)
            .with("mergedEntries", self.merged_entries as f64)
            .with("errors", self.errors.len() as f64)
            .with("durationMs", self.duration.as_millis() as f64)
    }
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle holds the in-progress flag
    AlreadyInProgress,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::AlreadyInProgress => None,
        }
    }
}

/// Clears the in-progress flag when a pass ends, however it ends
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncOrchestrator<B: HttpBackend = ReqwestBackend> {
    transport: TransportClient<B>,
    provider: Arc<dyn PatternProvider>,
    ratio: MergeRatio,
    files: Option<SyncFiles>,
    state: Mutex<SyncState>,
    merged: Mutex<Option<PackagedWeights>>,
    in_progress: AtomicBool,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator<ReqwestBackend> {
    /// Orchestrator talking to the configured service, with its files in
    /// the configured data directory
    pub fn from_config(config: &ClientConfig, provider: Arc<dyn PatternProvider>) -> Result<Self> {
        let files = SyncFiles::in_dir(&config.data_dir()?);
        let mut transport_config = config.transport.clone();
        if transport_config.queue_path.is_none() {
            transport_config.queue_path = Some(files.offline_queue.clone());
        }
        let transport = TransportClient::new(transport_config)?;
        let orchestrator = Self::new(transport, provider, config.merge_ratio, Some(files))?;
        Ok(orchestrator)
    }
}

impl<B: HttpBackend> SyncOrchestrator<B> {
    /// Build an orchestrator. With `files`, state and merged weights are
    /// loaded from and written to disk; without, everything stays in memory.
    pub fn new(
        transport: TransportClient<B>,
        provider: Arc<dyn PatternProvider>,
        ratio: MergeRatio,
        files: Option<SyncFiles>,
    ) -> Result<Self> {
        let (state, merged) = match &files {
            Some(files) => (files.load_state()?, files.load_merged().unwrap_or_else(|e| {
                warn!("Ignoring merged weights on disk: {:#}", e);
                None
            })),
            None => (SyncState::default(), None),
        };

        Ok(Self {
            transport,
            provider,
            ratio,
            files,
            state: Mutex::new(state),
            merged: Mutex::new(merged),
            in_progress: AtomicBool::new(false),
            timer: StdMutex::new(None),
        })
    }

    pub fn transport(&self) -> &TransportClient<B> {
        &self.transport
    }

    pub async fn state(&self) -> SyncState {
        self.state.lock().await.clone()
    }

    pub async fn client_id(&self) -> String {
        self.state.lock().await.client_id.clone()
    }

    /// Result of the last merge
    pub async fn merged_weights(&self) -> Option<PackagedWeights> {
        self.merged.lock().await.clone()
    }

    /// The last merge expressed as local patterns, for the host pipeline
    pub async fn merged_patterns(&self) -> Vec<LocalPattern> {
        self.merged
            .lock()
            .await
            .as_ref()
            .map(unpack)
            .unwrap_or_default()
    }

    /// A sync pass is running
    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Session start: download and merge, never upload
    pub async fn on_session_start(&self) -> SyncOutcome {
        let Some(_guard) = self.try_begin() else {
            return SyncOutcome::AlreadyInProgress;
        };
        let started = Instant::now();
        let mut report = SyncReport::default();

        let local = self.package_local(&mut report).await;
        self.download_and_merge(local.as_ref().map(|p| &p.weights), &mut report).await;
        self.persist_state(&mut report).await;

        report.duration = started.elapsed();
        SyncOutcome::Completed(report)
    }

    /// Session end: flush the offline queue, then upload local patterns
    pub async fn on_session_end(&self) -> SyncOutcome {
        let Some(_guard) = self.try_begin() else {
            return SyncOutcome::AlreadyInProgress;
        };
        let started = Instant::now();
        let mut report = SyncReport::default();

        self.flush(&mut report).await;
        if let Some(local) = self.package_local(&mut report).await {
            self.upload(&local, &mut report).await;
        }
        self.persist_state(&mut report).await;

        report.duration = started.elapsed();
        SyncOutcome::Completed(report)
    }

    /// Run a full cycle now
    pub async fn force_sync(&self) -> SyncOutcome {
        self.perform_sync().await
    }

    /// Flush, upload, download, merge, persist
    pub async fn perform_sync(&self) -> SyncOutcome {
        let Some(_guard) = self.try_begin() else {
            debug!("Sync already in progress");
            return SyncOutcome::AlreadyInProgress;
        };
        let started = Instant::now();
        let mut report = SyncReport::default();

        self.flush(&mut report).await;
        let local = self.package_local(&mut report).await;
        if let Some(local) = &local {
            self.upload(local, &mut report).await;
        }
        self.download_and_merge(local.as_ref().map(|p| &p.weights), &mut report).await;
        self.persist_state(&mut report).await;
        report.duration = started.elapsed();

        if !self.transport.report_telemetry(&report.telemetry()).await {
            debug!("Sync telemetry not delivered");
        }

        info!(
            "Sync finished in {:?}: {} flushed, upload {:?}, version {:?}, {} errors",
            report.duration,
            report.flushed,
            report.upload,
            report.version,
            report.errors.len()
        );
        SyncOutcome::Completed(report)
    }

    /// Stop the timer, if any
    pub fn cancel_sync(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = timer.take() {
            handle.abort();
            debug!("Sync timer cancelled");
        }
    }

    /// Stop the timer and flush state to disk
    pub async fn stop(&self) {
        self.cancel_sync();
        let mut state = self.state.lock().await;
        state.next_sync = None;
        if let Some(files) = &self.files {
            if let Err(e) = files.save_state(&state) {
                warn!("Failed to persist sync state: {:#}", e);
            }
        }
    }

    fn try_begin(&self) -> Option<InProgress<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InProgress(&self.in_progress))
    }

    async fn flush(&self, report: &mut SyncReport) {
        let flush = self.transport.flush_offline_queue().await;
        report.flushed = flush.flushed;
        report.errors.extend(flush.errors);
        if flush.flushed > 0 {
            let mut state = self.state.lock().await;
            state.total_uploads += flush.flushed as u64;
            state.last_upload = Some(Utc::now());
        }
        self.state.lock().await.pending_uploads = flush.remaining;
    }

    async fn package_local(&self, report: &mut SyncReport) -> Option<Package> {
        let patterns = match self.provider.local_patterns().await {
            Ok(patterns) => patterns,
            Err(e) => {
                report.errors.push(format!("pattern provider: {:#}", e));
                return None;
            }
        };
        match package(&patterns) {
            Ok(local) => {
                report.packaged = local.metadata.pattern_count;
                report.skipped = local.metadata.skipped;
                Some(local)
            }
            Err(e) => {
                report.errors.push(format!("packaging: {}", e));
                None
            }
        }
    }

    async fn upload(&self, local: &Package, report: &mut SyncReport) {
        if local.weights.is_empty() {
            debug!("No eligible patterns to upload");
            return;
        }

        let metadata = UploadMetadata {
            client_id: self.client_id().await,
            sample_size: local.metadata.sample_size,
            timestamp: Utc::now(),
        };
        match self.transport.upload_weights(&local.weights, metadata).await {
            Ok(outcome) => {
                let mut state = self.state.lock().await;
                match &outcome {
                    UploadOutcome::Accepted { timestamp, .. } => {
                        state.last_upload = Some(*timestamp);
                        state.total_uploads += 1;
                    }
                    UploadOutcome::Queued { queue_len } => {
                        state.pending_uploads = *queue_len;
                    }
                }
                report.upload = Some(outcome);
            }
            Err(e) => report.errors.push(format!("upload: {}", e)),
        }
    }

    async fn download_and_merge(&self, local: Option<&PackagedWeights>, report: &mut SyncReport) {
        let (since, client_id) = {
            let state = self.state.lock().await;
            (state.current_version.clone(), state.client_id.clone())
        };

        let response = match self
            .transport
            .download_latest_weights(since.as_deref(), Some(&client_id))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                report.errors.push(format!("download: {}", e));
                return;
            }
        };

        if let Some(global) = &response.weights {
            let empty = PackagedWeights::default();
            let merged = merge(local.unwrap_or(&empty), global, self.ratio);
            report.merged_entries = merged.len();
            if let Some(files) = &self.files {
                if let Err(e) = files.save_merged(&merged) {
                    report.errors.push(format!("persist merged weights: {:#}", e));
                }
            }
            *self.merged.lock().await = Some(merged);
        }

        let mut state = self.state.lock().await;
        state.last_download = Some(Utc::now());
        state.total_downloads += 1;
        if response.version.is_some() {
            state.current_version = response.version.clone();
        }
        report.version = response.version;
    }

    async fn persist_state(&self, report: &mut SyncReport) {
        let Some(files) = &self.files else {
            return;
        };
        let state = self.state.lock().await;
        if let Err(e) = files.save_state(&state) {
            report.errors.push(format!("persist sync state: {:#}", e));
        }
    }
}

impl<B: HttpBackend + 'static> SyncOrchestrator<B> {
    /// Arm the timer for the interval stored in the sync state
    pub async fn start(self: &Arc<Self>) {
        let interval = self.state.lock().await.interval;
        self.schedule_sync(interval).await;
    }

    /// Replace the current timer with one for `interval`
    ///
    /// Each timed cycle re-arms the timer for the next period. The timer
    /// holds only a weak reference and ends once the orchestrator is gone.
    pub async fn schedule_sync(self: &Arc<Self>, interval: SyncInterval) {
        self.cancel_sync();

        let next_sync = interval
            .period()
            .and_then(|p| chrono::Duration::from_std(p).ok())
            .map(|p| Utc::now() + p);
        {
            let mut state = self.state.lock().await;
            state.interval = interval;
            state.next_sync = next_sync;
        }
        let mut report = SyncReport::default();
        self.persist_state(&mut report).await;

        let Some(period) = interval.period() else {
            debug!("Session-driven syncing, no timer armed");
            return;
        };

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                if let SyncOutcome::AlreadyInProgress = orchestrator.perform_sync().await {
                    debug!("Timed sync skipped, another cycle is running");
                }
                let next = chrono::Duration::from_std(period).ok().map(|p| Utc::now() + p);
                orchestrator.state.lock().await.next_sync = next;
                let mut report = SyncReport::default();
                orchestrator.persist_state(&mut report).await;
            }
        });

        info!("Sync scheduled {}", interval);
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        *timer = Some(handle);
    }

    pub fn has_timer(&self) -> bool {
        self.timer
            .lock()
            .map(|timer| timer.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl<B: HttpBackend> Drop for SyncOrchestrator<B> {
    fn drop(&mut self) {
        self.cancel_sync();
    }
}
