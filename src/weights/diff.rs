//! Per-category differences between two weight sets

use serde::{Deserialize, Serialize};

use super::{Category, CategoryWeights, PackagedWeights};

/// What changed in one category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryDelta {
    #[serde(default)]
    pub added: CategoryWeights,
    #[serde(default)]
    pub changed: CategoryWeights,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl CategoryDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Differences between a known version and the current weights
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightsDelta {
    pub since: String,
    #[serde(default)]
    pub tools: CategoryDelta,
    #[serde(default)]
    pub errors: CategoryDelta,
    #[serde(default)]
    pub commands: CategoryDelta,
    #[serde(default)]
    pub teams: CategoryDelta,
}

impl WeightsDelta {
    pub fn category(&self, category: Category) -> &CategoryDelta {
        match category {
            Category::Tools => &self.tools,
            Category::Errors => &self.errors,
            Category::Commands => &self.commands,
            Category::Teams => &self.teams,
        }
    }

    fn category_mut(&mut self, category: Category) -> &mut CategoryDelta {
        match category {
            Category::Tools => &mut self.tools,
            Category::Errors => &mut self.errors,
            Category::Commands => &mut self.commands,
            Category::Teams => &mut self.teams,
        }
    }

    pub fn is_empty(&self) -> bool {
        Category::ALL.iter().all(|c| self.category(*c).is_empty())
    }
}

/// Compute what a holder of `old` needs to reach `new`
pub fn diff(since: &str, old: &PackagedWeights, new: &PackagedWeights) -> WeightsDelta {
    let mut delta = WeightsDelta {
        since: since.to_string(),
        ..Default::default()
    };

    for category in Category::ALL {
        let before = old.category(category);
        let after = new.category(category);
        let out = delta.category_mut(category);

        for (key, entry) in after {
            match before.get(key) {
                None => {
                    out.added.insert(key.clone(), entry.clone());
                }
                Some(previous) if previous != entry => {
                    out.changed.insert(key.clone(), entry.clone());
                }
                Some(_) => {}
            }
        }

        out.removed = before
            .keys()
            .filter(|key| !after.contains_key(*key))
            .cloned()
            .collect();
    }

    delta
}
