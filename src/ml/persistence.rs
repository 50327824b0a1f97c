//! Model bundle persistence.
//!
//! A bundle is a directory holding `network.bin` (burn record, full precision),
//! `metadata.json`, `recipe.json` and `training_history.json`. The first three
//! are required and must agree with each other for a load to succeed.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{ForecastModel, ForecastNetwork, ModelParams, TrainBackend};
use crate::recipe::{FeatureRecipe, RecipeError};
use crate::training::callbacks::TrainingHistory;

pub const NETWORK_FILE: &str = "network";
pub const METADATA_FILE: &str = "metadata.json";
pub const RECIPE_FILE: &str = "recipe.json";
pub const HISTORY_FILE: &str = "training_history.json";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("model is not fitted")]
    NotFitted,
    #[error("bundle file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("network record error: {0}")]
    Recorder(String),
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error("inconsistent bundle: {0}")]
    Inconsistent(String),
    #[error("bundle version mismatch: expected v{expected}, found v{found}")]
    VersionMismatch { expected: u32, found: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_name: String,
    pub is_fitted: bool,
    pub feature_names: Vec<String>,
    pub target_names: Vec<String>,
    pub model_params: ModelParams,
    /// `(sequence_length, features)`
    pub input_shape: (usize, usize),
    /// `(horizon, targets)`
    pub output_shape: (usize, usize),
    pub created_at: DateTime<Utc>,
    pub version: u32,
}

impl ModelMetadata {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn summary(&self) -> String {
        format!(
            "{} v{}: input={:?} output={:?} targets=[{}], created {}",
            self.model_name,
            self.version,
            self.input_shape,
            self.output_shape,
            self.target_names.join(", "),
            self.created_at.format("%Y-%m-%d %H:%M UTC")
        )
    }

    fn check_against(&self, recipe: &FeatureRecipe) -> Result<(), PersistenceError> {
        if !self.is_fitted {
            return Err(PersistenceError::NotFitted);
        }
        if self.feature_names != recipe.feature_names() {
            return Err(PersistenceError::Inconsistent(
                "feature names differ between metadata and recipe".to_string(),
            ));
        }
        if self.target_names != recipe.target_names() {
            return Err(PersistenceError::Inconsistent(
                "target names differ between metadata and recipe".to_string(),
            ));
        }
        if self.input_shape.1 != self.feature_names.len() {
            return Err(PersistenceError::Inconsistent(format!(
                "input shape {:?} does not match {} features",
                self.input_shape,
                self.feature_names.len()
            )));
        }
        if self.output_shape.1 != self.target_names.len() {
            return Err(PersistenceError::Inconsistent(format!(
                "output shape {:?} does not match {} targets",
                self.output_shape,
                self.target_names.len()
            )));
        }
        Ok(())
    }
}

/// A fitted model with the recipe that produces its inputs.
#[derive(Debug)]
pub struct ModelBundle {
    pub model: ForecastModel,
    pub recipe: FeatureRecipe,
    pub metadata: ModelMetadata,
}

/// Write a fitted model and its recipe to `dir`, creating it if needed.
pub fn save_bundle(
    dir: &Path,
    model: &ForecastModel,
    recipe: &FeatureRecipe,
) -> Result<ModelMetadata, PersistenceError> {
    let (network, input_shape, output_shape) = match (
        model.is_fitted().then(|| model.network()).flatten(),
        model.input_shape(),
        model.output_shape(),
    ) {
        (Some(net), Some(i), Some(o)) => (net, i, o),
        _ => return Err(PersistenceError::NotFitted),
    };

    let metadata = ModelMetadata {
        model_name: model.params().model_name.clone(),
        is_fitted: true,
        feature_names: recipe.feature_names().to_vec(),
        target_names: recipe.target_names().to_vec(),
        model_params: model.params().clone(),
        input_shape,
        output_shape,
        created_at: Utc::now(),
        version: ModelMetadata::CURRENT_VERSION,
    };
    metadata.check_against(recipe)?;

    fs::create_dir_all(dir).map_err(|source| PersistenceError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    network
        .clone()
        .save_file(dir.join(NETWORK_FILE), &recorder)
        .map_err(|e| PersistenceError::Recorder(format!("{e:?}")))?;
    write_json(&dir.join(METADATA_FILE), &metadata)?;
    recipe.save(&dir.join(RECIPE_FILE))?;
    write_json(&dir.join(HISTORY_FILE), model.history())?;

    tracing::info!(dir = %dir.display(), "Saved model bundle");
    Ok(metadata)
}

/// Load and cross-check a bundle written by [`save_bundle`].
pub fn load_bundle(dir: &Path) -> Result<ModelBundle, PersistenceError> {
    let network_path = dir.join(format!("{NETWORK_FILE}.bin"));
    for path in [&network_path, &dir.join(METADATA_FILE), &dir.join(RECIPE_FILE)] {
        if !path.exists() {
            return Err(PersistenceError::FileNotFound(path.clone()));
        }
    }

    let metadata: ModelMetadata = read_json(&dir.join(METADATA_FILE))?;
    if metadata.version != ModelMetadata::CURRENT_VERSION {
        return Err(PersistenceError::VersionMismatch {
            expected: ModelMetadata::CURRENT_VERSION,
            found: metadata.version,
        });
    }
    let recipe = FeatureRecipe::load(&dir.join(RECIPE_FILE))?;
    metadata.check_against(&recipe)?;
    metadata
        .model_params
        .validate()
        .map_err(|e| PersistenceError::Inconsistent(e.to_string()))?;

    let history_path = dir.join(HISTORY_FILE);
    let history: TrainingHistory = if history_path.exists() {
        read_json(&history_path)?
    } else {
        TrainingHistory::default()
    };

    let device = Default::default();
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let network = ForecastNetwork::<TrainBackend>::new(
        &metadata.model_params,
        metadata.input_shape,
        metadata.output_shape,
        &device,
    )
    .load_file(dir.join(NETWORK_FILE), &recorder, &device)
    .map_err(|e| PersistenceError::Recorder(format!("{e:?}")))?;

    let model = ForecastModel::from_fitted(
        metadata.model_params.clone(),
        network,
        metadata.input_shape,
        metadata.output_shape,
        history,
    );
    tracing::info!(summary = %metadata.summary(), "Loaded model bundle");
    Ok(ModelBundle {
        model,
        recipe,
        metadata,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| PersistenceError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let json = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&json).map_err(|source| PersistenceError::Json {
        path: path.to_path_buf(),
        source,
    })
}
