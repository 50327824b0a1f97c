//! Hyperparameter grids and trial sampling.

use std::collections::BTreeMap;
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use serde_json::Value;

use super::{TrainingError, TrainingOutcome};
use crate::ml::ModelParams;

/// Cartesian grid over [`ModelParams`] fields, e.g.
/// `{"lstm_units": [64, 128], "dropout_rate": [0.2, 0.3]}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamGrid {
    axes: BTreeMap<String, Vec<Value>>,
}

impl ParamGrid {
    pub fn new(axes: BTreeMap<String, Vec<Value>>) -> Result<Self, TrainingError> {
        if let Some((name, _)) = axes.iter().find(|(_, values)| values.is_empty()) {
            return Err(TrainingError::InvalidGrid(format!("'{name}' has no candidate values")));
        }
        Ok(Self { axes })
    }

    pub fn from_json(value: Value) -> Result<Self, TrainingError> {
        let Value::Object(map) = value else {
            return Err(TrainingError::InvalidGrid("grid must be a JSON object".to_string()));
        };
        let axes = map
            .into_iter()
            .map(|(name, values)| match values {
                Value::Array(values) => (name, values),
                other => (name, vec![other]),
            })
            .collect();
        Self::new(axes)
    }

    pub fn load(path: &Path) -> Result<Self, TrainingError> {
        let text = std::fs::read_to_string(path).map_err(|source| TrainingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(serde_json::from_str(&text)?)
    }

    /// Number of combinations; an empty grid has exactly one (the base params).
    pub fn len(&self) -> usize {
        self.axes.values().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combination at `index` in mixed-radix order (last axis varies fastest).
    pub fn combination(&self, mut index: usize) -> BTreeMap<String, Value> {
        let mut combo = BTreeMap::new();
        for (name, values) in self.axes.iter().rev() {
            combo.insert(name.clone(), values[index % values.len()].clone());
            index /= values.len();
        }
        combo
    }

    pub fn combinations(&self) -> Vec<BTreeMap<String, Value>> {
        (0..self.len()).map(|i| self.combination(i)).collect()
    }

    /// All combinations when the grid fits in `n_trials`, otherwise a seeded
    /// sample without replacement.
    pub fn sample(&self, n_trials: usize, seed: u64) -> Vec<BTreeMap<String, Value>> {
        let total = self.len();
        if total <= n_trials {
            return self.combinations();
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut indices = rand::seq::index::sample(&mut rng, total, n_trials).into_vec();
        indices.sort_unstable();
        indices.into_iter().map(|i| self.combination(i)).collect()
    }
}

/// Overlay grid values onto `base`; unknown fields and mistyped values are rejected.
pub fn apply_overrides(
    base: &ModelParams,
    overrides: &BTreeMap<String, Value>,
) -> Result<ModelParams, TrainingError> {
    let mut value = serde_json::to_value(base)?;
    let Some(fields) = value.as_object_mut() else {
        return Err(TrainingError::InvalidGrid("model params are not an object".to_string()));
    };
    for (key, v) in overrides {
        match fields.get_mut(key) {
            Some(slot) => *slot = v.clone(),
            None => return Err(TrainingError::InvalidGrid(format!("unknown parameter '{key}'"))),
        }
    }
    serde_json::from_value(value)
        .map_err(|e| TrainingError::InvalidGrid(format!("invalid parameter value: {e}")))
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchTrial {
    pub overrides: BTreeMap<String, Value>,
    /// Validation RMSE; infinite when the trial failed
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best_params: ModelParams,
    pub best_score: f64,
    pub trials: Vec<SearchTrial>,
    /// The best parameters retrained with the full epoch budget
    pub best: TrainingOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grid() -> ParamGrid {
        ParamGrid::from_json(json!({
            "lstm_units": [32, 64, 128],
            "dropout_rate": [0.1, 0.2],
        }))
        .unwrap()
    }

    // ==================== Grid ====================

    #[test]
    fn test_grid_len_and_combinations_are_unique() {
        let g = grid();
        assert_eq!(g.len(), 6);
        let combos = g.combinations();
        assert_eq!(combos.len(), 6);
        for (i, a) in combos.iter().enumerate() {
            for b in &combos[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_last_axis_varies_fastest() {
        let g = grid();
        assert_eq!(g.combination(0)["lstm_units"], json!(32));
        assert_eq!(g.combination(1)["lstm_units"], json!(64));
        assert_eq!(g.combination(3)["dropout_rate"], json!(0.2));
    }

    #[test]
    fn test_scalar_axis_is_single_value() {
        let g = ParamGrid::from_json(json!({"use_cnn": false})).unwrap();
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_empty_axis_rejected() {
        assert!(ParamGrid::from_json(json!({"lstm_units": []})).is_err());
        assert!(ParamGrid::from_json(json!([1, 2])).is_err());
    }

    #[test]
    fn test_empty_grid_has_one_combination() {
        let g = ParamGrid::default();
        assert_eq!(g.len(), 1);
        assert!(g.combination(0).is_empty());
    }

    // ==================== Sampling ====================

    #[test]
    fn test_sample_returns_all_when_grid_is_small() {
        assert_eq!(grid().sample(10, 42).len(), 6);
    }

    #[test]
    fn test_sample_is_seeded_and_without_replacement() {
        let g = grid();
        let a = g.sample(4, 7);
        let b = g.sample(4, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        for (i, x) in a.iter().enumerate() {
            assert!(!a[i + 1..].contains(x));
        }
    }

    // ==================== Overrides ====================

    #[test]
    fn test_apply_overrides_sets_fields() {
        let combo = grid().combination(5);
        let params = apply_overrides(&ModelParams::default(), &combo).unwrap();
        assert_eq!(params.lstm_units, 128);
        assert!((params.dropout_rate - 0.2).abs() < 1e-12);
        assert_eq!(params.num_layers, ModelParams::default().num_layers);
    }

    #[test]
    fn test_apply_overrides_rejects_unknown_and_mistyped() {
        let unknown = BTreeMap::from([("units".to_string(), json!(3))]);
        assert!(matches!(
            apply_overrides(&ModelParams::default(), &unknown),
            Err(TrainingError::InvalidGrid(_))
        ));
        let mistyped = BTreeMap::from([("lstm_units".to_string(), json!("many"))]);
        assert!(apply_overrides(&ModelParams::default(), &mistyped).is_err());
    }
}
