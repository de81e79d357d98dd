//! Local statistic types
//!
//! These are what the learning pipeline hands over and what unpacking hands
//! back. Each statistic kind is its own variant with its own raw fields.

use serde::{Deserialize, Serialize};

use super::Category;

/// Whether an error was recovered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recoverability {
    Yes,
    Partial,
    No,
}

impl Recoverability {
    pub fn weight(&self) -> f64 {
        match self {
            Recoverability::Yes => 1.0,
            Recoverability::Partial => 0.5,
            Recoverability::No => 0.0,
        }
    }

    /// Nearest level for a value that may have been averaged
    pub fn from_weight(value: f64) -> Self {
        if value >= 0.75 {
            Recoverability::Yes
        } else if value >= 0.25 {
            Recoverability::Partial
        } else {
            Recoverability::No
        }
    }
}

/// Test outcome after a command ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Pass,
    Partial,
    Fail,
}

impl TestOutcome {
    pub fn weight(&self) -> f64 {
        match self {
            TestOutcome::Pass => 1.0,
            TestOutcome::Partial => 0.5,
            TestOutcome::Fail => 0.0,
        }
    }

    pub fn from_weight(value: f64) -> Self {
        if value >= 0.75 {
            TestOutcome::Pass
        } else if value >= 0.25 {
            TestOutcome::Partial
        } else {
            TestOutcome::Fail
        }
    }
}

/// Raw statistic, one variant per kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PatternStats {
    Tool {
        success_rate: f64,
        avg_latency_ms: f64,
    },
    Error {
        /// Never populated for patterns that came from the swarm
        message: Option<String>,
        recoverable: Recoverability,
    },
    Command {
        effectiveness: f64,
        avg_duration_ms: f64,
        files_modified: f64,
        tests_pass: TestOutcome,
    },
    Team {
        effectiveness: f64,
        optimal_size: f64,
        avg_duration_ms: f64,
    },
}

impl PatternStats {
    pub fn category(&self) -> Category {
        match self {
            PatternStats::Tool { .. } => Category::Tools,
            PatternStats::Error { .. } => Category::Errors,
            PatternStats::Command { .. } => Category::Commands,
            PatternStats::Team { .. } => Category::Teams,
        }
    }
}

/// Where a pattern came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternSource {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "swarm-global")]
    SwarmGlobal,
}

impl std::fmt::Display for PatternSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternSource::Local => write!(f, "local"),
            PatternSource::SwarmGlobal => write!(f, "swarm-global"),
        }
    }
}

/// A statistic in local format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalPattern {
    /// Tool name, command name, team composition, or for errors an
    /// anonymized signature once it has been through the swarm
    pub name: String,
    /// Confidence assigned by the learning pipeline, never sent raw
    /// except as part of a tool entry
    pub confidence: f64,
    pub sample_size: u64,
    pub stats: PatternStats,
    pub source: PatternSource,
}

impl LocalPattern {
    pub fn new(name: impl Into<String>, confidence: f64, sample_size: u64, stats: PatternStats) -> Self {
        Self {
            name: name.into(),
            confidence,
            sample_size,
            stats,
            source: PatternSource::Local,
        }
    }

    pub fn tool(name: &str, success_rate: f64, avg_latency_ms: f64, confidence: f64, sample_size: u64) -> Self {
        Self::new(
            name,
            confidence,
            sample_size,
            PatternStats::Tool { success_rate, avg_latency_ms },
        )
    }

    pub fn error(message: &str, recoverable: Recoverability, confidence: f64, sample_size: u64) -> Self {
        Self::new(
            message,
            confidence,
            sample_size,
            PatternStats::Error {
                message: Some(message.to_string()),
                recoverable,
            },
        )
    }

    pub fn category(&self) -> Category {
        self.stats.category()
    }
}
