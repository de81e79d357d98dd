//! Shareable weight representation
//!
//! Normalized, anonymized statistics exchanged between installations and the
//! aggregation service. Every category is a sorted map so the JSON
//! serialization of a [`PackagedWeights`] is canonical and its checksum does
//! not depend on insertion order.

pub mod codec;
pub mod diff;
pub mod merge;
pub mod normalize;
pub mod pattern;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

pub use codec::{package, unpack, Package, PackageMetadata, MIN_CONFIDENCE, MIN_SAMPLE_SIZE};
pub use diff::{diff, CategoryDelta, WeightsDelta};
pub use merge::{merge, MergeRatio};
pub use normalize::Saturation;
pub use pattern::{LocalPattern, PatternSource, PatternStats, Recoverability, TestOutcome};

/// Largest sample size accepted from the wire, 2^53, the last integer an
/// `f64` share computation represents exactly
pub const MAX_SAMPLE_SIZE: u64 = 1 << 53;

/// Numeric fields that are counts rather than ratios
pub const COUNT_FIELDS: &[&str] = &["optimalSize"];

/// A weight entry outside the ranges every entry must keep
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidEntry {
    #[error("{category}/{key}: sampleSize {sample_size} exceeds {limit}")]
    SampleSize {
        category: Category,
        key: String,
        sample_size: u64,
        limit: u64,
    },
    #[error("{category}/{key}: {field} = {value} is out of range")]
    OutOfRange {
        category: Category,
        key: String,
        field: String,
        value: f64,
    },
}

/// The four statistic categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Tools,
    Errors,
    Commands,
    Teams,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Tools,
        Category::Errors,
        Category::Commands,
        Category::Teams,
    ];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Tools => write!(f, "tools"),
            Category::Errors => write!(f, "errors"),
            Category::Commands => write!(f, "commands"),
            Category::Teams => write!(f, "teams"),
        }
    }
}

/// A single field value inside a weight entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Number(_) => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// One normalized statistic
///
/// `sample_size` is a count and is never averaged. Every other field lives
/// in `fields`; numeric ones are bounded to `[0,1]` unless they are
/// explicitly a count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    #[serde(rename = "sampleSize")]
    pub sample_size: u64,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl WeightEntry {
    pub fn new(sample_size: u64) -> Self {
        Self {
            sample_size,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_number(mut self, name: &str, value: f64) -> Self {
        self.fields.insert(name.to_string(), FieldValue::Number(value));
        self
    }

    pub fn with_text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), FieldValue::Text(value.into()));
        self
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(FieldValue::as_str)
    }

    /// First numeric field outside its range: `[0,1]` for ratios,
    /// finite and non-negative for counts
    pub fn out_of_range(&self) -> Option<(&str, f64)> {
        self.fields.iter().find_map(|(name, value)| {
            let n = value.as_f64()?;
            let ok = if COUNT_FIELDS.contains(&name.as_str()) {
                n.is_finite() && n >= 0.0
            } else {
                (0.0..=1.0).contains(&n)
            };
            (!ok).then_some((name.as_str(), n))
        })
    }
}

/// Category key -> entry
pub type CategoryWeights = BTreeMap<String, WeightEntry>;

/// The normalized, shareable weight object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackagedWeights {
    #[serde(default)]
    pub tools: CategoryWeights,
    #[serde(default)]
    pub errors: CategoryWeights,
    #[serde(default)]
    pub commands: CategoryWeights,
    #[serde(default)]
    pub teams: CategoryWeights,
}

impl PackagedWeights {
    pub fn category(&self, category: Category) -> &CategoryWeights {
        match category {
            Category::Tools => &self.tools,
            Category::Errors => &self.errors,
            Category::Commands => &self.commands,
            Category::Teams => &self.teams,
        }
    }

    pub fn category_mut(&mut self, category: Category) -> &mut CategoryWeights {
        match category {
            Category::Tools => &mut self.tools,
            Category::Errors => &mut self.errors,
            Category::Commands => &mut self.commands,
            Category::Teams => &mut self.teams,
        }
    }

    /// Number of entries across all categories
    pub fn len(&self) -> usize {
        Category::ALL.iter().map(|c| self.category(*c).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the sample sizes of every entry
    pub fn total_sample_size(&self) -> u64 {
        Category::ALL
            .iter()
            .flat_map(|c| self.category(*c).values())
            .fold(0u64, |total, e| total.saturating_add(e.sample_size))
    }

    /// Reject sample sizes above [`MAX_SAMPLE_SIZE`] and out of range fields
    pub fn validate(&self) -> Result<(), InvalidEntry> {
        for category in Category::ALL {
            for (key, entry) in self.category(category) {
                if entry.sample_size > MAX_SAMPLE_SIZE {
                    return Err(InvalidEntry::SampleSize {
                        category,
                        key: key.clone(),
                        sample_size: entry.sample_size,
                        limit: MAX_SAMPLE_SIZE,
                    });
                }
                if let Some((field, value)) = entry.out_of_range() {
                    return Err(InvalidEntry::OutOfRange {
                        category,
                        key: key.clone(),
                        field: field.to_string(),
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    /// Canonical JSON bytes, the input of [`checksum`]
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Lowercase hex SHA-256 of the canonical serialization of `weights`
pub fn checksum(weights: &PackagedWeights) -> serde_json::Result<String> {
    let bytes = weights.canonical_bytes()?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Irreversible short hash used to anonymize keys and messages
pub fn anonymize(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}
