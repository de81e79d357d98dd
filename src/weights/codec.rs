//! Packaging local statistics into shareable weights and back

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::normalize::{clamp_unit, FILE_COUNT, TASK_DURATION, TOOL_LATENCY};
use super::pattern::{LocalPattern, PatternSource, PatternStats, Recoverability, TestOutcome};
use super::{anonymize, checksum, Category, PackagedWeights, WeightEntry};

/// Minimum sample size for a statistic to be shared
pub const MIN_SAMPLE_SIZE: u64 = 3;

/// Minimum learner confidence for a statistic to be shared
pub const MIN_CONFIDENCE: f64 = 0.4;

/// Characters of an error message that feed its signature
const MESSAGE_PREFIX_CHARS: usize = 100;

/// Summary of a packaging pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    pub pattern_count: usize,
    pub skipped: usize,
    pub sample_size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Output of [`package`]
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub weights: PackagedWeights,
    pub metadata: PackageMetadata,
    pub checksum: String,
}

/// Whether a statistic may leave the machine
pub fn is_eligible(pattern: &LocalPattern) -> bool {
    pattern.sample_size >= MIN_SAMPLE_SIZE
        && pattern.confidence.is_finite()
        && pattern.confidence >= MIN_CONFIDENCE
}

/// Filter, normalize and anonymize local statistics
pub fn package(patterns: &[LocalPattern]) -> serde_json::Result<Package> {
    let mut weights = PackagedWeights::default();
    let mut skipped = 0;

    for pattern in patterns {
        if !is_eligible(pattern) {
            skipped += 1;
            continue;
        }

        let (key, entry) = normalize_pattern(pattern);
        let bucket = weights.category_mut(pattern.category());
        match bucket.get(&key) {
            Some(existing) if existing.sample_size >= entry.sample_size => {
                debug!("Keeping larger sample for {}/{}", pattern.category(), key);
            }
            _ => {
                bucket.insert(key, entry);
            }
        }
    }

    let checksum = checksum(&weights)?;
    let metadata = PackageMetadata {
        pattern_count: weights.len(),
        skipped,
        sample_size: weights.total_sample_size(),
        timestamp: Utc::now(),
    };

    Ok(Package {
        weights,
        metadata,
        checksum,
    })
}

fn normalize_pattern(pattern: &LocalPattern) -> (String, WeightEntry) {
    let entry = WeightEntry::new(pattern.sample_size);
    match &pattern.stats {
        PatternStats::Tool { success_rate, avg_latency_ms } => (
            pattern.name.clone(),
            entry
                .with_number("successRate", clamp_unit(*success_rate))
                .with_number("avgLatency", TOOL_LATENCY.normalize(*avg_latency_ms))
                .with_number("confidence", clamp_unit(pattern.confidence)),
        ),
        PatternStats::Error { message, recoverable } => {
            let source = message.as_deref().unwrap_or(&pattern.name);
            let prefix: String = source.chars().take(MESSAGE_PREFIX_CHARS).collect();
            let signature = anonymize(&prefix);
            (
                signature.clone(),
                entry
                    .with_number("frequency", clamp_unit(1.0 - pattern.confidence))
                    .with_number("recoverable", recoverable.weight())
                    .with_text("signature", signature),
            )
        }
        PatternStats::Command {
            effectiveness,
            avg_duration_ms,
            files_modified,
            tests_pass,
        } => (
            pattern.name.clone(),
            entry
                .with_number("effectiveness", clamp_unit(*effectiveness))
                .with_number("avgDuration", TASK_DURATION.normalize(*avg_duration_ms))
                .with_number("filesModified", FILE_COUNT.normalize(*files_modified))
                .with_number("testsPass", tests_pass.weight()),
        ),
        PatternStats::Team {
            effectiveness,
            optimal_size,
            avg_duration_ms,
        } => (
            pattern.name.clone(),
            entry
                .with_number("effectiveness", clamp_unit(*effectiveness))
                .with_number("optimalSize", optimal_size.max(0.0))
                .with_number("avgDuration", TASK_DURATION.normalize(*avg_duration_ms)),
        ),
    }
}

/// Reconstruct local-format patterns from global weights
///
/// Entries missing a required field are skipped. Error patterns never carry
/// a message: the key is a one-way hash.
pub fn unpack(weights: &PackagedWeights) -> Vec<LocalPattern> {
    let mut patterns = Vec::with_capacity(weights.len());

    for category in Category::ALL {
        for (key, entry) in weights.category(category) {
            match denormalize_entry(category, key, entry) {
                Some(pattern) => patterns.push(pattern),
                None => debug!("Skipping incomplete {} entry {}", category, key),
            }
        }
    }

    patterns
}

fn denormalize_entry(category: Category, key: &str, entry: &WeightEntry) -> Option<LocalPattern> {
    let (confidence, stats) = match category {
        Category::Tools => {
            let success_rate = entry.number("successRate")?;
            let stats = PatternStats::Tool {
                success_rate,
                avg_latency_ms: TOOL_LATENCY.denormalize(entry.number("avgLatency")?),
            };
            (entry.number("confidence").unwrap_or(success_rate), stats)
        }
        Category::Errors => {
            let frequency = entry.number("frequency")?;
            let stats = PatternStats::Error {
                message: None,
                recoverable: Recoverability::from_weight(entry.number("recoverable")?),
            };
            (1.0 - frequency, stats)
        }
        Category::Commands => {
            let effectiveness = entry.number("effectiveness")?;
            let stats = PatternStats::Command {
                effectiveness,
                avg_duration_ms: TASK_DURATION.denormalize(entry.number("avgDuration")?),
                files_modified: FILE_COUNT.denormalize(entry.number("filesModified")?),
                tests_pass: TestOutcome::from_weight(entry.number("testsPass")?),
            };
            (effectiveness, stats)
        }
        Category::Teams => {
            let effectiveness = entry.number("effectiveness")?;
            let stats = PatternStats::Team {
                effectiveness,
                optimal_size: entry.number("optimalSize")?,
                avg_duration_ms: TASK_DURATION.denormalize(entry.number("avgDuration")?),
            };
            (effectiveness, stats)
        }
    };

    Some(LocalPattern {
        name: key.to_string(),
        confidence: clamp_unit(confidence),
        sample_size: entry.sample_size,
        stats,
        source: PatternSource::SwarmGlobal,
    })
}
