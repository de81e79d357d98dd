//! Client sync state and the files it lives in

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::schedule::SyncInterval;
use crate::weights::PackagedWeights;

pub const STATE_FILE: &str = "sync-state.json";
pub const MERGED_WEIGHTS_FILE: &str = "merged-weights.json";
pub const QUEUE_FILE: &str = "offline-queue.json";

/// Per-installation sync bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Random, generated once per installation
    #[serde(default = "new_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub last_upload: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_download: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_uploads: usize,
    #[serde(default)]
    pub next_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_version: Option<String>,
    #[serde(default)]
    pub interval: SyncInterval,
    #[serde(default)]
    pub total_uploads: u64,
    #[serde(default)]
    pub total_downloads: u64,
}

fn new_client_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            client_id: new_client_id(),
            last_upload: None,
            last_download: None,
            pending_uploads: 0,
            next_sync: None,
            current_version: None,
            interval: SyncInterval::default(),
            total_uploads: 0,
            total_downloads: 0,
        }
    }
}

/// Locations of the client's persisted files
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFiles {
    pub state: PathBuf,
    pub merged_weights: PathBuf,
    pub offline_queue: PathBuf,
}

impl SyncFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            state: dir.join(STATE_FILE),
            merged_weights: dir.join(MERGED_WEIGHTS_FILE),
            offline_queue: dir.join(QUEUE_FILE),
        }
    }

    /// Load the state, starting fresh when the file is missing or unreadable
    pub fn load_state(&self) -> Result<SyncState> {
        if !self.state.exists() {
            return Ok(SyncState::default());
        }
        let content = std::fs::read_to_string(&self.state)
            .with_context(|| format!("Failed to read {}", self.state.display()))?;
        match serde_json::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Resetting unreadable sync state {}: {}", self.state.display(), e);
                Ok(SyncState::default())
            }
        }
    }

    pub fn save_state(&self, state: &SyncState) -> Result<()> {
        write_json(&self.state, state)
    }

    pub fn load_merged(&self) -> Result<Option<PackagedWeights>> {
        if !self.merged_weights.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.merged_weights)
            .with_context(|| format!("Failed to read {}", self.merged_weights.display()))?;
        let weights = serde_json::from_str(&content).context("Failed to parse merged weights")?;
        Ok(Some(weights))
    }

    pub fn save_merged(&self, weights: &PackagedWeights) -> Result<()> {
        write_json(&self.merged_weights, weights)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create sync directory")?;
    }
    let json = serde_json::to_string_pretty(value).context("Failed to serialize")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
