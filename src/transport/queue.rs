//! Persistent offline queue of uploads waiting for connectivity

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::warn;

use crate::protocol::{UploadMetadata, UploadRequest};
use crate::weights::PackagedWeights;

/// Default number of pending uploads kept
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedKind {
    Upload,
}

/// An upload that could not reach the service
///
/// The weights are stored after scrubbing and noise injection so a replay
/// sends exactly what was checksummed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    #[serde(rename = "type")]
    pub kind: QueuedKind,
    pub weights: PackagedWeights,
    pub metadata: UploadMetadata,
    pub checksum: String,
    pub queued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn upload(request: &UploadRequest, checksum: String) -> Self {
        Self {
            kind: QueuedKind::Upload,
            weights: request.weights.clone(),
            metadata: request.metadata.clone(),
            checksum,
            queued_at: Utc::now(),
        }
    }

    pub fn to_request(&self) -> UploadRequest {
        UploadRequest {
            weights: self.weights.clone(),
            metadata: self.metadata.clone(),
            checksum: Some(self.checksum.clone()),
        }
    }
}

/// Bounded FIFO, oldest entries dropped first
#[derive(Debug)]
pub struct OfflineQueue {
    path: Option<PathBuf>,
    capacity: usize,
    entries: VecDeque<QueueEntry>,
}

impl OfflineQueue {
    /// In-memory queue
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            path: None,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Queue backed by a JSON file, loading whatever is already there
    pub fn load(path: PathBuf, capacity: usize) -> Result<Self> {
        let mut entries = VecDeque::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str::<VecDeque<QueueEntry>>(&content) {
                Ok(loaded) => entries = loaded,
                Err(e) => warn!("Discarding unreadable offline queue {}: {}", path.display(), e),
            }
        }

        let mut queue = Self {
            path: Some(path),
            capacity: capacity.max(1),
            entries,
        };
        queue.enforce_capacity();
        Ok(queue)
    }

    /// Append an entry, returning how many old entries were dropped
    pub fn push(&mut self, entry: QueueEntry) -> usize {
        self.entries.push_back(entry);
        self.enforce_capacity()
    }

    /// Remove and return everything, oldest first
    pub fn take_all(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    /// Put undelivered entries back in front of anything queued since
    pub fn restore_front(&mut self, undelivered: Vec<QueueEntry>) {
        for entry in undelivered.into_iter().rev() {
            self.entries.push_front(entry);
        }
        self.enforce_capacity();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Write the queue to disk, if file backed
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create queue directory")?;
        }
        let json = serde_json::to_string_pretty(&self.entries).context("Failed to serialize offline queue")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn enforce_capacity(&mut self) -> usize {
        let mut dropped = 0;
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Offline queue full, dropped {} oldest entries", dropped);
        }
        dropped
    }
}
