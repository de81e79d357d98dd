//! Blending local weights with the global model

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Category, CategoryWeights, FieldValue, PackagedWeights, WeightEntry};

const RATIO_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeRatioError {
    #[error("merge ratio components must lie in [0, 1], got ({local}, {global})")]
    OutOfRange { local: f64, global: f64 },
    #[error("merge ratio must sum to 1.0, got {0}")]
    BadSum(f64),
}

/// `(local, global)` blend factors summing to one
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 2]", into = "[f64; 2]")]
pub struct MergeRatio {
    local: f64,
    global: f64,
}

impl MergeRatio {
    pub fn new(local: f64, global: f64) -> Result<Self, MergeRatioError> {
        let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_range(local) || !in_range(global) {
            return Err(MergeRatioError::OutOfRange { local, global });
        }
        let sum = local + global;
        if (sum - 1.0).abs() > RATIO_TOLERANCE {
            return Err(MergeRatioError::BadSum(sum));
        }
        Ok(Self { local, global })
    }

    pub fn local(&self) -> f64 {
        self.local
    }

    pub fn global(&self) -> f64 {
        self.global
    }
}

impl Default for MergeRatio {
    fn default() -> Self {
        Self { local: 0.3, global: 0.7 }
    }
}

impl TryFrom<[f64; 2]> for MergeRatio {
    type Error = MergeRatioError;

    fn try_from(value: [f64; 2]) -> Result<Self, Self::Error> {
        Self::new(value[0], value[1])
    }
}

impl From<MergeRatio> for [f64; 2] {
    fn from(ratio: MergeRatio) -> Self {
        [ratio.local, ratio.global]
    }
}

/// Blend local and global weights key by key
///
/// Numeric fields present on both sides become `local*l + global*g`,
/// sample sizes are summed, one-sided fields and keys pass through
/// untouched, and text fields present on both sides take the global value.
pub fn merge(local: &PackagedWeights, global: &PackagedWeights, ratio: MergeRatio) -> PackagedWeights {
    let mut merged = PackagedWeights::default();
    for category in Category::ALL {
        *merged.category_mut(category) =
            merge_category(local.category(category), global.category(category), ratio);
    }
    merged
}

fn merge_category(local: &CategoryWeights, global: &CategoryWeights, ratio: MergeRatio) -> CategoryWeights {
    let mut merged = CategoryWeights::new();

    for (key, local_entry) in local {
        let entry = match global.get(key) {
            Some(global_entry) => merge_entry(local_entry, global_entry, ratio),
            None => local_entry.clone(),
        };
        merged.insert(key.clone(), entry);
    }

    for (key, global_entry) in global {
        if !local.contains_key(key) {
            merged.insert(key.clone(), global_entry.clone());
        }
    }

    merged
}

fn merge_entry(local: &WeightEntry, global: &WeightEntry, ratio: MergeRatio) -> WeightEntry {
    let mut entry = WeightEntry::new(local.sample_size.saturating_add(global.sample_size));

    for (name, local_value) in &local.fields {
        let value = match (local_value, global.fields.get(name)) {
            (FieldValue::Number(l), Some(FieldValue::Number(g))) => {
                FieldValue::Number(l * ratio.local + g * ratio.global)
            }
            (_, Some(global_value)) => global_value.clone(),
            (_, None) => local_value.clone(),
        };
        entry.fields.insert(name.clone(), value);
    }

    for (name, global_value) in &global.fields {
        if !local.fields.contains_key(name) {
            entry.fields.insert(name.clone(), global_value.clone());
        }
    }

    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::checksum;

    fn weights(rate: f64, samples: u64) -> PackagedWeights {
        let mut weights = PackagedWeights::default();
        weights.tools.insert(
            "Read".to_string(),
            WeightEntry::new(samples)
                .with_number("successRate", rate)
                .with_number("avgLatency", 0.25),
        );
        weights
    }

    #[test]
    fn test_ratio_validation() {
        assert!(MergeRatio::new(0.3, 0.7).is_ok());
        assert!(MergeRatio::new(0.0, 1.0).is_ok());
        assert!(matches!(MergeRatio::new(0.5, 0.6), Err(MergeRatioError::BadSum(_))));
        assert!(matches!(MergeRatio::new(-0.5, 1.5), Err(MergeRatioError::OutOfRange { .. })));
        assert!(MergeRatio::new(f64::NAN, 1.0).is_err());
        assert_eq!(MergeRatio::default().local(), 0.3);
    }

    #[test]
    fn test_ratio_serde() {
        let ratio: MergeRatio = serde_json::from_str("[0.4, 0.6]").unwrap();
        assert_eq!(ratio.global(), 0.6);
        assert!(serde_json::from_str::<MergeRatio>("[0.4, 0.4]").is_err());
    }

    #[test]
    fn test_weighted_blend_and_summed_samples() {
        let merged = merge(&weights(1.0, 5), &weights(0.0, 20), MergeRatio::default());
        let entry = &merged.tools["Read"];
        assert!((entry.number("successRate").unwrap() - 0.3).abs() < 1e-12);
        assert_eq!(entry.sample_size, 25);
    }

    #[test]
    fn test_merge_with_self_is_identity() {
        let a = weights(0.8, 5);
        for (l, g) in [(0.3, 0.7), (0.5, 0.5), (0.0, 1.0), (0.9, 0.1)] {
            let merged = merge(&a, &a, MergeRatio::new(l, g).unwrap());
            let rate = merged.tools["Read"].number("successRate").unwrap();
            assert!((rate - 0.8).abs() < 1e-12);
            let latency = merged.tools["Read"].number("avgLatency").unwrap();
            assert!((latency - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn test_one_sided_keys_and_fields_pass_through() {
        let mut local = weights(0.5, 3);
        local.teams.insert("solo".to_string(), WeightEntry::new(4).with_number("effectiveness", 0.6));
        local
            .tools
            .get_mut("Read")
            .unwrap()
            .fields
            .insert("confidence".to_string(), FieldValue::Number(0.9));

        let mut global = weights(0.5, 3);
        global.commands.insert("make".to_string(), WeightEntry::new(8).with_number("effectiveness", 0.2));

        let merged = merge(&local, &global, MergeRatio::default());
        assert_eq!(merged.teams["solo"], local.teams["solo"]);
        assert_eq!(merged.commands["make"], global.commands["make"]);
        assert_eq!(merged.tools["Read"].number("confidence"), Some(0.9));
        assert!(merged.errors.is_empty());
    }

    #[test]
    fn test_text_fields_prefer_global() {
        let mut local = PackagedWeights::default();
        local.errors.insert("k".to_string(), WeightEntry::new(3).with_text("signature", "local"));
        let mut global = PackagedWeights::default();
        global.errors.insert("k".to_string(), WeightEntry::new(3).with_text("signature", "global"));

        let merged = merge(&local, &global, MergeRatio::default());
        assert_eq!(merged.errors["k"].text("signature"), Some("global"));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let local = weights(0.35, 4);
        let global = weights(0.9, 11);
        let first = checksum(&merge(&local, &global, MergeRatio::default())).unwrap();
        for _ in 0..5 {
            let again = checksum(&merge(&local, &global, MergeRatio::default())).unwrap();
            assert_eq!(first, again);
        }
    }
}
