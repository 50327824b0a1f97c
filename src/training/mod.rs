//! Training orchestration: data preparation, fitting, search and evaluation.

pub mod augment;
pub mod callbacks;
pub mod search;
pub mod tracking;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::evaluation::{
    EvaluationError, MetricsReport, accuracy_summary, calculate_sequence_metrics, compare_models,
    create_evaluation_plots,
};
use crate::frame::{Frame, FrameError, load_sites};
use crate::ml::persistence::{ModelBundle, save_bundle};
use crate::ml::{FitOptions, ForecastModel, ModelError, ModelParams, PersistenceError};
use crate::quality::QualityReport;
use crate::recipe::{FeatureRecipe, RecipeError};
use crate::sequence::{SequenceError, Sequences, chronological_split, make_sequences};

use callbacks::TrainingHistory;
use search::{ParamGrid, SearchOutcome, SearchTrial, apply_overrides};
use tracking::{RunRecord, Tracker};

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error("no {0} sequences: every segment is shorter than sequence_length + forecast_horizon")]
    NoSequences(&'static str),
    #[error("{0} requires validation data")]
    MissingValidation(&'static str),
    #[error("invalid search grid: {0}")]
    InvalidGrid(String),
    #[error("every search trial failed")]
    SearchFailed,
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sequences ready for fitting plus the recipe that produced them.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub train: Sequences,
    pub val: Option<Sequences>,
    pub test: Option<Sequences>,
    pub recipe: FeatureRecipe,
    pub quality_report: Option<QualityReport>,
}

impl PreparedData {
    pub fn target_names(&self) -> &[String] {
        self.recipe.target_names()
    }

    fn validation(&self) -> Option<(&ndarray::Array3<f32>, &ndarray::Array3<f32>)> {
        self.val.as_ref().map(|v| (&v.x, &v.y))
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub model_name: String,
    pub params: ModelParams,
    pub history: TrainingHistory,
    pub val_metrics: Option<MetricsReport>,
    pub bundle_dir: Option<PathBuf>,
    pub run_id: Option<String>,
}

/// Drives the full pipeline for one configuration.
pub struct ModelTrainer {
    config: AppConfig,
    tracker: Tracker,
    models: BTreeMap<String, ForecastModel>,
}

impl ModelTrainer {
    pub fn new(config: AppConfig) -> Self {
        let tracker = Tracker::new(&config.tracking, &config.network);
        Self::with_tracker(config, tracker)
    }

    pub fn with_tracker(config: AppConfig, tracker: Tracker) -> Self {
        Self {
            config,
            tracker,
            models: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn models(&self) -> impl Iterator<Item = (&str, &ForecastModel)> {
        self.models.iter().map(|(name, model)| (name.as_str(), model))
    }

    /// Per-site frames from a CSV file or directory.
    pub fn load_segments(path: &Path) -> Result<Vec<Frame>, TrainingError> {
        Ok(load_sites(path)?.into_iter().map(|(_, frame)| frame).collect())
    }

    /// Split every segment chronologically, fit the recipe on the training
    /// parts only and window each transformed segment independently.
    pub fn prepare_data(&self, segments: Vec<Frame>) -> Result<PreparedData, TrainingError> {
        let split = self.config.split;
        let mut train_parts = Vec::new();
        let mut val_parts = Vec::new();
        let mut test_parts = Vec::new();
        for segment in &segments {
            let (train, val, test) =
                chronological_split(segment, split.train_ratio, split.val_ratio, split.test_ratio)?;
            for (part, parts) in [
                (train, &mut train_parts),
                (val, &mut val_parts),
                (test, &mut test_parts),
            ] {
                if !part.is_empty() {
                    parts.push(part);
                }
            }
        }
        if train_parts.is_empty() {
            return Err(TrainingError::NoSequences("training"));
        }

        let (recipe, train_frames, quality_report) = FeatureRecipe::fit(
            train_parts,
            &self.config.data.targets,
            &self.config.features,
            &self.config.quality,
        )?;
        let val_frames = transform_all(&recipe, val_parts)?;
        let test_frames = transform_all(&recipe, test_parts)?;

        let (l, h) = (
            self.config.training.sequence_length,
            self.config.training.forecast_horizon,
        );
        let train = windows(&train_frames, &recipe, l, h)?.ok_or(TrainingError::NoSequences("training"))?;
        let val = windows(&val_frames, &recipe, l, h)?;
        let test = windows(&test_frames, &recipe, l, h)?;

        info!(
            train = train.len(),
            val = val.as_ref().map_or(0, Sequences::len),
            test = test.as_ref().map_or(0, Sequences::len),
            features = recipe.feature_names().len(),
            "Prepared sequences"
        );
        Ok(PreparedData {
            train,
            val,
            test,
            recipe,
            quality_report,
        })
    }

    fn fit_options(&self, params: &ModelParams) -> FitOptions {
        let mut options = FitOptions::from(&self.config.training);
        options.checkpoint_dir = self
            .config
            .paths
            .checkpoint_dir
            .as_ref()
            .map(|dir| dir.join(&params.model_name));
        options
    }

    /// Fit one model, score it on validation data and optionally save the bundle.
    pub fn train_model(
        &mut self,
        params: ModelParams,
        data: &PreparedData,
        save: bool,
    ) -> Result<TrainingOutcome, TrainingError> {
        let name = params.model_name.clone();
        info!(model = %name, samples = data.train.len(), "Training model");

        let options = self.fit_options(&params);
        let mut model = ForecastModel::new(params.clone());
        let history = model
            .fit(&data.train.x, &data.train.y, data.validation(), &options)?
            .clone();

        let val_metrics = match &data.val {
            Some(val) => {
                let pred = model.predict(&val.x)?;
                let report = calculate_sequence_metrics(&val.y, &pred, data.target_names())?;
                info!(model = %name, rmse = report.rmse, r2 = report.r2, "Validation metrics");
                Some(report)
            }
            None => None,
        };

        let bundle_dir = if save {
            let dir = self
                .config
                .paths
                .model_dir
                .join(format!("{name}_{}", Local::now().format("%Y%m%d_%H%M%S")));
            save_bundle(&dir, &model, &data.recipe)?;
            Some(dir)
        } else {
            None
        };

        let mut record = RunRecord::default();
        record_params(&mut record, &params);
        record
            .param("sequence_length", self.config.training.sequence_length)
            .param("forecast_horizon", self.config.training.forecast_horizon)
            .param("n_features", data.recipe.feature_names().len());
        record_history(&mut record, &history);
        if let Some(report) = &val_metrics {
            record_report(&mut record, "val", report);
        }
        let run_id = self.tracker.log_run(&name, &record);

        self.models.insert(name.clone(), model);
        Ok(TrainingOutcome {
            model_name: name,
            params,
            history,
            val_metrics,
            bundle_dir,
            run_id,
        })
    }

    /// Train each configuration; failures are logged and skipped.
    pub fn train_multiple_models(
        &mut self,
        configs: Vec<ModelParams>,
        data: &PreparedData,
    ) -> Vec<TrainingOutcome> {
        let total = configs.len();
        let mut outcomes = Vec::with_capacity(total);
        for (i, params) in configs.into_iter().enumerate() {
            let name = params.model_name.clone();
            info!(model = %name, index = i + 1, total, "Training configuration");
            match self.train_model(params, data, true) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(model = %name, error = %e, "Model training failed, skipping"),
            }
        }
        outcomes
    }

    /// Score sampled grid points by validation RMSE, then retrain the best.
    pub fn hyperparameter_search(
        &mut self,
        grid: &ParamGrid,
        n_trials: usize,
        data: &PreparedData,
    ) -> Result<SearchOutcome, TrainingError> {
        let Some(val) = &data.val else {
            return Err(TrainingError::MissingValidation("hyperparameter search"));
        };
        let candidates = grid.sample(n_trials, self.config.training.seed);
        info!(grid = grid.len(), trials = candidates.len(), "Starting hyperparameter search");

        let mut trials = Vec::with_capacity(candidates.len());
        let mut best: Option<(f64, ModelParams)> = None;
        for (i, overrides) in candidates.into_iter().enumerate() {
            let result = apply_overrides(&self.config.model, &overrides)
                .and_then(|params| self.score_trial(&params, data, val).map(|s| (s, params)));
            let score = match result {
                Ok((score, params)) => {
                    if score.is_finite() && best.as_ref().is_none_or(|(b, _)| score < *b) {
                        best = Some((score, params));
                    }
                    score
                }
                Err(e) => {
                    warn!(trial = i, error = %e, "Search trial failed");
                    f64::INFINITY
                }
            };
            info!(trial = i, score, "Search trial finished");

            let mut record = RunRecord::default();
            for (key, value) in &overrides {
                record.param(key.clone(), json_param(value));
            }
            record.metric("val_rmse", score, 0);
            self.tracker.log_run(&format!("search_trial_{i}"), &record);

            trials.push(SearchTrial { overrides, score });
        }

        let (best_score, best_params) = best.ok_or(TrainingError::SearchFailed)?;
        info!(score = best_score, "Retraining best configuration");
        let outcome = self.train_model(best_params.clone(), data, true)?;
        Ok(SearchOutcome {
            best_params,
            best_score,
            trials,
            best: outcome,
        })
    }

    fn score_trial(
        &self,
        params: &ModelParams,
        data: &PreparedData,
        val: &Sequences,
    ) -> Result<f64, TrainingError> {
        let mut options = FitOptions::from(&self.config.training);
        options.epochs = self.config.training.search_epochs;
        let mut model = ForecastModel::new(params.clone());
        model.fit(&data.train.x, &data.train.y, Some((&val.x, &val.y)), &options)?;
        let pred = model.predict(&val.x)?;
        Ok(calculate_sequence_metrics(&val.y, &pred, data.target_names())?.rmse)
    }

    /// Test metrics and diagnostic plots for every trained model.
    pub fn evaluate_models(
        &mut self,
        test: &Sequences,
        target_names: &[String],
    ) -> Vec<(String, MetricsReport)> {
        let mut results = Vec::with_capacity(self.models.len());
        for (name, model) in &self.models {
            match evaluate_one(&self.config, &mut self.tracker, name, model, test, target_names) {
                Ok(report) => results.push((name.clone(), report)),
                Err(e) => warn!(model = %name, error = %e, "Evaluation failed, skipping"),
            }
        }
        if results.len() > 1 {
            if let Ok(ranking) = compare_models(&results, "rmse") {
                for (rank, row) in ranking.iter().enumerate() {
                    info!(rank = rank + 1, model = %row.model, rmse = row.rmse, r2 = row.r2, "Model ranking");
                }
            }
        }
        results
    }

    /// Evaluate a saved bundle on the test split of `segments`.
    pub fn evaluate_bundle(
        &mut self,
        bundle: &ModelBundle,
        segments: Vec<Frame>,
    ) -> Result<MetricsReport, TrainingError> {
        let split = self.config.split;
        let mut test_parts = Vec::new();
        for segment in &segments {
            let (_, _, test) =
                chronological_split(segment, split.train_ratio, split.val_ratio, split.test_ratio)?;
            if !test.is_empty() {
                test_parts.push(test);
            }
        }
        let frames = transform_all(&bundle.recipe, test_parts)?;
        let (l, h) = (bundle.metadata.input_shape.0, bundle.metadata.output_shape.0);
        let test = windows(&frames, &bundle.recipe, l, h)?.ok_or(TrainingError::NoSequences("test"))?;
        evaluate_one(
            &self.config,
            &mut self.tracker,
            &bundle.metadata.model_name,
            &bundle.model,
            &test,
            bundle.recipe.target_names(),
        )
    }
}

fn transform_all(recipe: &FeatureRecipe, frames: Vec<Frame>) -> Result<Vec<Frame>, TrainingError> {
    Ok(frames
        .into_iter()
        .map(|f| recipe.transform(f))
        .collect::<Result<Vec<_>, _>>()?)
}

/// Window each segment separately so no sample spans two sites.
fn windows(
    frames: &[Frame],
    recipe: &FeatureRecipe,
    sequence_length: usize,
    horizon: usize,
) -> Result<Option<Sequences>, TrainingError> {
    let mut parts = Vec::with_capacity(frames.len());
    for frame in frames {
        match make_sequences(
            frame,
            recipe.feature_names(),
            recipe.target_names(),
            sequence_length,
            horizon,
        ) {
            Ok(seq) => parts.push(seq),
            Err(SequenceError::NotEnoughRows { required, available }) => {
                debug!(required, available, "Segment too short for a sequence, skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Sequences::concat(&parts))
}

fn evaluate_one(
    config: &AppConfig,
    tracker: &mut Tracker,
    name: &str,
    model: &ForecastModel,
    test: &Sequences,
    target_names: &[String],
) -> Result<MetricsReport, TrainingError> {
    let pred = model.predict(&test.x)?;
    let report = calculate_sequence_metrics(&test.y, &pred, target_names)?;
    info!(model = %name, "Test accuracy\n{}", accuracy_summary(&report));

    let plots = create_evaluation_plots(&test.y, &pred, target_names, &config.paths.plots_dir, name);
    debug!(model = %name, count = plots.len(), "Evaluation plots written");

    let mut record = RunRecord::default();
    record.param("model_name", name);
    record_report(&mut record, "test", &report);
    tracker.log_run(&format!("{name}_evaluation"), &record);
    Ok(report)
}

fn json_param(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn record_params(record: &mut RunRecord, params: &ModelParams) {
    if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(params) {
        for (key, value) in &fields {
            record.param(key.clone(), json_param(value));
        }
    }
}

fn record_history(record: &mut RunRecord, history: &TrainingHistory) {
    for epoch in 0..history.epochs() {
        let step = epoch as i64;
        record
            .metric("loss", history.loss[epoch], step)
            .metric("accuracy_10_percent", history.accuracy_10_percent[epoch], step)
            .metric("r_squared", history.r_squared[epoch], step)
            .metric("learning_rate", history.learning_rate[epoch], step);
        if let Some(v) = history.val_loss[epoch] {
            record.metric("val_loss", v, step);
        }
        if let Some(v) = history.val_accuracy_10_percent[epoch] {
            record.metric("val_accuracy_10_percent", v, step);
        }
    }
}

fn record_report(record: &mut RunRecord, prefix: &str, report: &MetricsReport) {
    for (key, value) in [
        ("rmse", report.rmse),
        ("mae", report.mae),
        ("mape", report.mape),
        ("r2", report.r2),
        ("bias", report.bias),
        ("index_of_agreement", report.index_of_agreement),
        ("nash_sutcliffe", report.nash_sutcliffe),
        ("overall_accuracy_score", report.overall_accuracy_score),
        ("accuracy_within_10_percent", report.accuracy_within_10_percent),
    ] {
        record.metric(format!("{prefix}_{key}"), value, 0);
    }
    for target in &report.targets {
        record
            .metric(format!("{prefix}_{}_rmse", target.name), target.rmse, 0)
            .metric(format!("{prefix}_{}_r2", target.name), target.r2, 0);
    }
}
