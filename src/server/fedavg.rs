//! Federated averaging over stored snapshots

use std::collections::BTreeSet;

use super::store::WeightSnapshot;
use crate::weights::{Category, FieldValue, PackagedWeights, WeightEntry};

/// Merge snapshots into one global weight object
///
/// Every contributor of a key is weighted by its share of the summed sample
/// size for that key. Numeric fields are renormalized over the contributors
/// that carry them and rounded to four decimals, sample sizes are summed,
/// and text fields come from the largest contributor (earliest on ties).
/// When all contributors of a key report a zero sample size they count
/// equally.
pub fn federated_average(snapshots: &[WeightSnapshot]) -> PackagedWeights {
    match snapshots {
        [] => PackagedWeights::default(),
        [only] => only.weights.clone(),
        _ => {
            let mut global = PackagedWeights::default();
            for category in Category::ALL {
                let keys: BTreeSet<&String> = snapshots
                    .iter()
                    .flat_map(|s| s.weights.category(category).keys())
                    .collect();
                let out = global.category_mut(category);
                for key in keys {
                    let contributors: Vec<&WeightEntry> = snapshots
                        .iter()
                        .filter_map(|s| s.weights.category(category).get(key))
                        .collect();
                    out.insert(key.clone(), average_entry(&contributors));
                }
            }
            global
        }
    }
}

fn average_entry(contributors: &[&WeightEntry]) -> WeightEntry {
    let total = contributors
        .iter()
        .fold(0u64, |total, e| total.saturating_add(e.sample_size));
    let share = |entry: &WeightEntry| -> f64 {
        if total == 0 {
            1.0 / contributors.len() as f64
        } else {
            entry.sample_size as f64 / total as f64
        }
    };

    let mut merged = WeightEntry::new(total);
    let field_names: BTreeSet<&String> = contributors.iter().flat_map(|e| e.fields.keys()).collect();

    for name in field_names {
        let numeric: Vec<(f64, f64)> = contributors
            .iter()
            .filter_map(|e| match e.fields.get(name) {
                Some(FieldValue::Number(v)) => Some((share(e), *v)),
                _ => None,
            })
            .collect();

        if !numeric.is_empty() {
            let weight_sum: f64 = numeric.iter().map(|(w, _)| w).sum();
            let value = if weight_sum > 0.0 {
                numeric.iter().map(|(w, v)| w * v).sum::<f64>() / weight_sum
            } else {
                numeric.iter().map(|(_, v)| v).sum::<f64>() / numeric.len() as f64
            };
            merged.fields.insert(name.clone(), FieldValue::Number(round4(value)));
            continue;
        }

        let mut chosen: Option<&WeightEntry> = None;
        for entry in contributors.iter().filter(|e| matches!(e.fields.get(name), Some(FieldValue::Text(_)))) {
            match chosen {
                Some(current) if entry.sample_size <= current.sample_size => {}
                _ => chosen = Some(entry),
            }
        }
        if let Some(value) = chosen.and_then(|e| e.fields.get(name)) {
            merged.fields.insert(name.clone(), value.clone());
        }
    }

    merged
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::store::SnapshotMetadata;
    use chrono::Utc;

    fn snapshot(version: &str, weights: PackagedWeights) -> WeightSnapshot {
        WeightSnapshot {
            version: version.to_string(),
            metadata: SnapshotMetadata {
                client_id: format!("client-{}", version),
                checksum: String::new(),
                sample_size: weights.total_sample_size(),
                timestamp: Utc::now(),
            },
            weights,
        }
    }

    fn tool(rate: f64, sample_size: u64) -> PackagedWeights {
        let mut weights = PackagedWeights::default();
        weights.tools.insert(
            "Read".to_string(),
            WeightEntry::new(sample_size).with_number("successRate", rate),
        );
        weights
    }

    #[test]
    fn test_sample_size_weighting() {
        let global = federated_average(&[snapshot("v1", tool(0.0, 1)), snapshot("v2", tool(1.0, 9))]);
        let entry = &global.tools["Read"];
        assert_eq!(entry.number("successRate"), Some(0.9));
        assert_eq!(entry.sample_size, 10);
    }

    #[test]
    fn test_single_snapshot_unchanged() {
        let weights = tool(0.123456789, 4);
        let global = federated_average(&[snapshot("v1", weights.clone())]);
        assert_eq!(global, weights);
    }

    #[test]
    fn test_empty_input() {
        assert!(federated_average(&[]).is_empty());
    }

    #[test]
    fn test_key_union_and_partial_fields() {
        let mut a = tool(0.5, 2);
        a.errors.insert("e1".to_string(), WeightEntry::new(3).with_number("frequency", 0.2));
        let mut b = tool(0.7, 2);
        b.tools
            .get_mut("Read")
            .unwrap()
            .fields
            .insert("avgLatency".to_string(), FieldValue::Number(0.4));

        let global = federated_average(&[snapshot("v1", a), snapshot("v2", b)]);
        let read = &global.tools["Read"];
        assert_eq!(read.number("successRate"), Some(0.6));
        // carried only by b, renormalized over b alone
        assert_eq!(read.number("avgLatency"), Some(0.4));
        assert_eq!(global.errors["e1"].number("frequency"), Some(0.2));
        assert_eq!(global.errors["e1"].sample_size, 3);
    }

    #[test]
    fn test_text_from_largest_contributor() {
        let entry = |size: u64, signature: &str| {
            let mut weights = PackagedWeights::default();
            weights
                .errors
                .insert("k".to_string(), WeightEntry::new(size).with_text("signature", signature));
            weights
        };
        let global = federated_average(&[
            snapshot("v1", entry(5, "first")),
            snapshot("v2", entry(8, "largest")),
            snapshot("v3", entry(8, "tie")),
        ]);
        assert_eq!(global.errors["k"].text("signature"), Some("largest"));
    }

    #[test]
    fn test_zero_sample_sizes_are_uniform() {
        let global = federated_average(&[snapshot("v1", tool(0.2, 0)), snapshot("v2", tool(0.6, 0))]);
        assert_eq!(global.tools["Read"].number("successRate"), Some(0.4));
        assert_eq!(global.tools["Read"].sample_size, 0);
    }

    #[test]
    fn test_huge_sample_sizes_saturate() {
        let global = federated_average(&[
            snapshot("v1", tool(1.0, u64::MAX)),
            snapshot("v2", tool(0.0, 5)),
            snapshot("v3", tool(0.0, 5)),
        ]);
        let entry = &global.tools["Read"];
        assert_eq!(entry.sample_size, u64::MAX);
        let rate = entry.number("successRate").unwrap();
        assert!((0.0..=1.0).contains(&rate));
    }
}
