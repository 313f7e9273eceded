use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{mean, std};

/// Mean and spread of one metric within a group of trials.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub mean: f64,
    pub std: f64,
    pub count: usize,
}

/// Groups `(key, value)` pairs by key and summarises each group.
///
/// A group with a single value has a std of zero rather than undefined, so it still
/// draws as a (degenerate) band.
pub fn bands<K: Ord>(rows: impl IntoIterator<Item = (K, f64)>) -> Vec<(K, Band)> {
    let mut groups: BTreeMap<K, Vec<f64>> = BTreeMap::new();
    for (key, value) in rows {
        groups.entry(key).or_default().push(value);
    }
    groups
        .into_iter()
        .map(|(key, values)| {
            let band = Band {
                mean: mean(&values).unwrap_or_default(),
                std: std(&values).unwrap_or_default(),
                count: values.len(),
            };
            (key, band)
        })
        .collect()
}
