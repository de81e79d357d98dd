//! Privacy hooks applied before anything is uploaded
//!
//! Scrubbing always runs first, noise second, and the checksum is computed
//! over the result.

use crate::weights::normalize::clamp_unit;
use tracing::warn;

use crate::weights::{anonymize, Category, FieldValue, PackagedWeights, WeightEntry, COUNT_FIELDS};

/// Removes anything that could identify the user
pub trait PiiScrubber: Send + Sync {
    fn scrub(&self, weights: PackagedWeights) -> PackagedWeights;
}

/// Perturbs statistics for differential privacy
pub trait NoiseInjector: Send + Sync {
    fn inject(&self, weights: PackagedWeights) -> PackagedWeights;
}

impl<F> PiiScrubber for F
where
    F: Fn(PackagedWeights) -> PackagedWeights + Send + Sync,
{
    fn scrub(&self, weights: PackagedWeights) -> PackagedWeights {
        self(weights)
    }
}

impl<F> NoiseInjector for F
where
    F: Fn(PackagedWeights) -> PackagedWeights + Send + Sync,
{
    fn inject(&self, weights: PackagedWeights) -> PackagedWeights {
        self(weights)
    }
}

/// Text fields allowed to leave the machine
const ALLOWED_TEXT_FIELDS: &[&str] = &["signature"];

/// Conservative scrubber used when the caller does not supply one
///
/// Keys that look like paths, URLs or e-mail addresses are hashed, ratios
/// are clamped to `[0,1]`, and text fields other than the error signature
/// are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultScrubber;

impl PiiScrubber for DefaultScrubber {
    fn scrub(&self, weights: PackagedWeights) -> PackagedWeights {
        let mut scrubbed = PackagedWeights::default();
        for category in Category::ALL {
            let out = scrubbed.category_mut(category);
            for (key, entry) in weights.category(category) {
                let key = if looks_sensitive(key) { anonymize(key) } else { key.clone() };
                let entry = scrub_entry(entry);
                match out.get(&key) {
                    Some(existing) => {
                        warn!("Scrubbed key collision in {}, keeping the larger sample", category);
                        if entry.sample_size > existing.sample_size {
                            out.insert(key, entry);
                        }
                    }
                    None => {
                        out.insert(key, entry);
                    }
                }
            }
        }
        scrubbed
    }
}

fn looks_sensitive(key: &str) -> bool {
    key.contains('/') || key.contains('\\') || key.contains('@') || key.contains("://") || key.contains('~')
}

fn scrub_entry(entry: &WeightEntry) -> WeightEntry {
    let mut clean = WeightEntry::new(entry.sample_size);
    for (name, value) in &entry.fields {
        match value {
            FieldValue::Number(n) if COUNT_FIELDS.contains(&name.as_str()) => {
                let n = if n.is_finite() { n.max(0.0) } else { 0.0 };
                clean.fields.insert(name.clone(), FieldValue::Number(n));
            }
            FieldValue::Number(n) => {
                clean.fields.insert(name.clone(), FieldValue::Number(clamp_unit(*n)));
            }
            FieldValue::Text(_) if ALLOWED_TEXT_FIELDS.contains(&name.as_str()) => {
                clean.fields.insert(name.clone(), value.clone());
            }
            FieldValue::Text(_) => {}
        }
    }
    clean
}
