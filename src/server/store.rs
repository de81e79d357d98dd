//! Versioned snapshot storage, contribution counters and telemetry

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::fedavg::federated_average;
use crate::config::ServerConfig;
use crate::protocol::{ContributionStats, UploadMetadata};
use crate::weights::{checksum, PackagedWeights};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub client_id: String,
    pub checksum: String,
    pub sample_size: u64,
    pub timestamp: DateTime<Utc>,
}

/// One accepted upload. Never modified after it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub version: String,
    pub weights: PackagedWeights,
    pub metadata: SnapshotMetadata,
}

/// The averaged model as of a given version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalModel {
    pub version: String,
    pub weights: PackagedWeights,
    pub checksum: String,
    pub contributors: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContribution {
    pub uploads: u64,
    pub downloads: u64,
    pub last_upload: Option<DateTime<Utc>>,
    pub last_download: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub stats: BTreeMap<String, f64>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub snapshot_retention: usize,
    pub fedavg_window: usize,
    pub telemetry_capacity: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            snapshot_retention: 100,
            fedavg_window: 50,
            telemetry_capacity: 10_000,
        }
    }
}

impl From<&ServerConfig> for StoreLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            snapshot_retention: config.snapshot_retention.max(1),
            fedavg_window: config.fedavg_window.max(1),
            telemetry_capacity: config.telemetry_capacity.max(1),
        }
    }
}

/// On-disk layout. Telemetry is not persisted.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedStore {
    next_version: u64,
    snapshots: VecDeque<WeightSnapshot>,
    history: VecDeque<GlobalModel>,
    contributions: HashMap<String, ClientContribution>,
}

/// Serialized store contents, written without holding the store lock
///
/// `generation` orders images taken from the same store; a writer should
/// never replace a newer image with an older one.
#[derive(Debug, Clone)]
pub struct StoreImage {
    path: PathBuf,
    generation: u64,
    json: Vec<u8>,
}

impl StoreImage {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomic replace through a temporary file
    pub async fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create store directory")?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &self.json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn write_blocking(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &self.json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Single-writer store. Callers wrap it in a lock.
#[derive(Debug)]
pub struct Store {
    limits: StoreLimits,
    path: Option<PathBuf>,
    /// Bumped on every persisted mutation
    generation: u64,
    next_version: u64,
    snapshots: VecDeque<WeightSnapshot>,
    /// Global models, newest last, bounded like the snapshots
    history: VecDeque<GlobalModel>,
    contributions: HashMap<String, ClientContribution>,
    telemetry: VecDeque<TelemetryRecord>,
}

impl Store {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            path: None,
            generation: 0,
            next_version: 1,
            snapshots: VecDeque::new(),
            history: VecDeque::new(),
            contributions: HashMap::new(),
            telemetry: VecDeque::new(),
        }
    }

    /// Store persisted to `path`, resuming from its contents if present
    pub fn open(path: PathBuf, limits: StoreLimits) -> Result<Self> {
        let mut store = Self::new(limits);
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store {}", path.display()))?;
            let persisted: PersistedStore = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse store {}", path.display()))?;
            store.next_version = persisted.next_version.max(1);
            store.snapshots = persisted.snapshots;
            store.history = persisted.history;
            store.contributions = persisted.contributions;
            store.trim();
            info!(
                "Restored {} snapshots, next version v{}",
                store.snapshots.len(),
                store.next_version
            );
        }
        store.path = Some(path);
        Ok(store)
    }

    /// Serialize the store for writing, if it has a path
    pub fn image(&self) -> Result<Option<StoreImage>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let persisted = PersistedStore {
            next_version: self.next_version,
            snapshots: self.snapshots.clone(),
            history: self.history.clone(),
            contributions: self.contributions.clone(),
        };
        let json = serde_json::to_vec(&persisted).context("Failed to serialize store")?;
        Ok(Some(StoreImage {
            path: path.clone(),
            generation: self.generation,
            json,
        }))
    }

    /// Write the store to disk now, blocking, if it has a path
    pub fn persist(&self) -> Result<()> {
        match self.image()? {
            Some(image) => image.write_blocking(),
            None => Ok(()),
        }
    }

    /// Store a new snapshot under the next version and recompute the
    /// global model
    pub fn accept_upload(
        &mut self,
        weights: PackagedWeights,
        metadata: &UploadMetadata,
        digest: String,
    ) -> serde_json::Result<WeightSnapshot> {
        let version = format!("v{}", self.next_version);
        self.next_version += 1;

        let now = Utc::now();
        let sample_size = if metadata.sample_size > 0 {
            metadata.sample_size
        } else {
            weights.total_sample_size()
        };
        let snapshot = WeightSnapshot {
            version: version.clone(),
            weights,
            metadata: SnapshotMetadata {
                client_id: metadata.client_id.clone(),
                checksum: digest,
                sample_size,
                timestamp: now,
            },
        };
        self.snapshots.push_back(snapshot.clone());

        let contribution = self.contributions.entry(metadata.client_id.clone()).or_default();
        contribution.uploads += 1;
        contribution.last_upload = Some(now);

        self.recompute_global(&version)?;
        self.trim();
        self.generation += 1;

        debug!("Stored snapshot {} from {}", version, metadata.client_id);
        Ok(snapshot)
    }

    fn recompute_global(&mut self, version: &str) -> serde_json::Result<()> {
        let window = self.limits.fedavg_window.min(self.snapshots.len());
        let recent: Vec<WeightSnapshot> = self
            .snapshots
            .iter()
            .skip(self.snapshots.len() - window)
            .cloned()
            .collect();
        let weights = federated_average(&recent);
        let digest = checksum(&weights)?;
        self.history.push_back(GlobalModel {
            version: version.to_string(),
            weights,
            checksum: digest,
            contributors: recent.len(),
            updated_at: Utc::now(),
        });
        Ok(())
    }

    fn trim(&mut self) {
        while self.snapshots.len() > self.limits.snapshot_retention {
            if let Some(evicted) = self.snapshots.pop_front() {
                debug!("Evicted snapshot {}", evicted.version);
            }
        }
        while self.history.len() > self.limits.snapshot_retention {
            self.history.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&GlobalModel> {
        self.history.back()
    }

    /// Global model as it was at `version`, while still retained
    pub fn global_at(&self, version: &str) -> Option<&GlobalModel> {
        self.history.iter().rev().find(|g| g.version == version)
    }

    pub fn record_download(&mut self, client_id: &str) {
        let contribution = self.contributions.entry(client_id.to_string()).or_default();
        contribution.downloads += 1;
        contribution.last_download = Some(Utc::now());
        self.generation += 1;
    }

    /// Append a telemetry record, returning how many are held
    pub fn record_telemetry(&mut self, stats: BTreeMap<String, f64>) -> usize {
        self.telemetry.push_back(TelemetryRecord {
            stats,
            received_at: Utc::now(),
        });
        while self.telemetry.len() > self.limits.telemetry_capacity {
            self.telemetry.pop_front();
        }
        self.telemetry.len()
    }

    pub fn contribution_stats(&self, client_id: &str) -> ContributionStats {
        let total_clients = self.contributions.len();
        match self.contributions.get(client_id) {
            Some(own) => {
                let ahead = self
                    .contributions
                    .values()
                    .filter(|c| c.uploads > own.uploads)
                    .count();
                ContributionStats {
                    client_id: client_id.to_string(),
                    uploads: own.uploads,
                    downloads: own.downloads,
                    rank: Some(ahead + 1),
                    total_clients,
                    last_upload: own.last_upload,
                    last_download: own.last_download,
                }
            }
            None => ContributionStats {
                client_id: client_id.to_string(),
                uploads: 0,
                downloads: 0,
                rank: None,
                total_clients,
                last_upload: None,
                last_download: None,
            },
        }
    }

    pub fn client_count(&self) -> usize {
        self.contributions.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn telemetry_count(&self) -> usize {
        self.telemetry.len()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &WeightSnapshot> {
        self.snapshots.iter()
    }
}
