//! Sync cadence

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How often the orchestrator runs a full cycle on its own
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncInterval {
    /// No timer; cycles only run from the session hooks or `force_sync`
    #[default]
    Session,
    Hourly,
    Daily,
}

impl SyncInterval {
    /// Timer period, `None` for session-driven syncing
    pub fn period(&self) -> Option<Duration> {
        match self {
            SyncInterval::Session => None,
            SyncInterval::Hourly => Some(Duration::from_secs(60 * 60)),
            SyncInterval::Daily => Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl fmt::Display for SyncInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncInterval::Session => write!(f, "session"),
            SyncInterval::Hourly => write!(f, "hourly"),
            SyncInterval::Daily => write!(f, "daily"),
        }
    }
}

impl FromStr for SyncInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(SyncInterval::Session),
            "hourly" => Ok(SyncInterval::Hourly),
            "daily" => Ok(SyncInterval::Daily),
            other => Err(format!("unknown sync interval '{}' (expected session, hourly or daily)", other)),
        }
    }
}
