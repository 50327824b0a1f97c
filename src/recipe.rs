//! Versioned, serializable description of the full feature pipeline.
//!
//! A recipe is produced once from training data and persisted alongside the
//! model. Inference replays it verbatim: nothing is re-estimated from the
//! incoming rows.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FeatureSettings;
use crate::features::{FeatureEngineer, FeatureError, FeatureState};
use crate::frame::{Frame, FrameError};
use crate::quality::{DataQualityEnhancer, QualityError, QualityOptions, QualityReport, QualityState};

pub const RECIPE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Quality(#[from] QualityError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid recipe JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("recipe version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecipe {
    pub version: u32,
    pub targets: Vec<String>,
    pub reference_latitude: f64,
    pub features: FeatureState,
    pub quality: QualityState,
    /// Model input columns in order
    pub feature_names: Vec<String>,
}

impl FeatureRecipe {
    /// Fit the recipe on one or more chronologically ordered segments and
    /// return the transformed segments.
    pub fn fit(
        segments: Vec<Frame>,
        targets: &[String],
        settings: &FeatureSettings,
        options: &QualityOptions,
    ) -> Result<(Self, Vec<Frame>, Option<QualityReport>), RecipeError> {
        let mut engineer = FeatureEngineer::new(
            targets.to_vec(),
            settings.temperature_unit,
            settings.reference_latitude,
        );
        engineer.fit(&Frame::concat(&segments)?)?;
        let engineered = segments
            .into_iter()
            .map(|s| engineer.transform(s))
            .collect::<Result<Vec<_>, _>>()?;

        let mut enhancer = DataQualityEnhancer::new(options.clone(), targets.to_vec());
        let frames = enhancer.fit_transform_segments(engineered)?;

        let quality = enhancer.state().cloned().ok_or(QualityError::NotFitted)?;
        let features = engineer.state().cloned().ok_or(FeatureError::NotFitted)?;
        let feature_names = quality
            .columns()
            .filter(|c| !targets.iter().any(|t| t == c))
            .map(str::to_string)
            .collect::<Vec<_>>();

        tracing::info!(features = feature_names.len(), "Feature recipe fitted");
        let recipe = Self {
            version: RECIPE_VERSION,
            targets: targets.to_vec(),
            reference_latitude: settings.reference_latitude,
            features,
            quality,
            feature_names,
        };
        Ok((recipe, frames, enhancer.quality_report().cloned()))
    }

    /// Replay the recipe on raw rows.
    pub fn transform(&self, frame: Frame) -> Result<Frame, RecipeError> {
        let engineer = FeatureEngineer::from_state(
            self.targets.clone(),
            self.reference_latitude,
            self.features.clone(),
        );
        let enhancer = DataQualityEnhancer::from_state(self.quality.clone());
        let engineered = engineer.transform(frame)?;
        Ok(enhancer.transform_new_data(engineered)?)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn target_names(&self) -> &[String] {
        &self.targets
    }

    pub fn save(&self, path: &Path) -> Result<(), RecipeError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| RecipeError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, RecipeError> {
        let json = fs::read_to_string(path).map_err(|source| RecipeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let recipe: Self = serde_json::from_str(&json)?;
        if recipe.version != RECIPE_VERSION {
            return Err(RecipeError::UnsupportedVersion {
                found: recipe.version,
                expected: RECIPE_VERSION,
            });
        }
        Ok(recipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn raw(rows: usize) -> Frame {
        let hours: Vec<f64> = (0..rows).map(|i| (i % 24) as f64).collect();
        Frame::from_columns([
            ("year", vec![2024.0; rows]),
            ("month", vec![5.0; rows]),
            ("day", (0..rows).map(|i| (1 + i / 24) as f64).collect()),
            ("hour", hours.clone()),
            ("u_forecast", hours.iter().map(|h| 1.0 + h * 0.1).collect()),
            ("v_forecast", hours.iter().map(|h| 2.0 - h * 0.05).collect()),
            ("T_forecast", hours.iter().map(|h| 300.0 + h * 0.2).collect()),
            ("O3_forecast", hours.iter().map(|h| 30.0 + h).collect()),
            ("NO2_forecast", hours.iter().map(|h| 70.0 - h).collect()),
            ("O3_target", hours.iter().map(|h| 32.0 + h).collect()),
        ])
        .unwrap()
    }

    fn targets() -> Vec<String> {
        vec!["O3_target".to_string()]
    }

    #[test]
    fn test_fit_then_transform_parity() {
        let (recipe, frames, report) =
            FeatureRecipe::fit(vec![raw(96)], &targets(), &FeatureSettings::default(), &QualityOptions::default())
                .unwrap();
        assert!(report.is_some());
        let replayed = recipe.transform(raw(96)).unwrap();
        assert!(frames[0].same_values(&replayed));
        assert!(!recipe.feature_names().contains(&"O3_target".to_string()));
        assert!(recipe.feature_names().contains(&"O3_target_lag_1".to_string()));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recipe.json");
        let (recipe, _, _) =
            FeatureRecipe::fit(vec![raw(60)], &targets(), &FeatureSettings::default(), &QualityOptions::default())
                .unwrap();
        recipe.save(&path).unwrap();
        let loaded = FeatureRecipe::load(&path).unwrap();
        assert_eq!(loaded.feature_names, recipe.feature_names);
        assert!(recipe.transform(raw(50)).unwrap().same_values(&loaded.transform(raw(50)).unwrap()));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recipe.json");
        let (mut recipe, _, _) =
            FeatureRecipe::fit(vec![raw(60)], &targets(), &FeatureSettings::default(), &QualityOptions::default())
                .unwrap();
        recipe.version = 99;
        recipe.save(&path).unwrap();
        assert!(matches!(
            FeatureRecipe::load(&path),
            Err(RecipeError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
