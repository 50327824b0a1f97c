//! Deep sequence model for pollutant forecasting.
//!
//! [`ForecastModel`] owns a burn network and moves through
//! `Unbuilt -> Built -> Fitted`. Training runs on the autodiff backend, all
//! predictions on the plain ndarray backend.

pub mod confidence;
pub mod metrics;
pub mod network;
pub mod persistence;

use std::path::PathBuf;

use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use ndarray::{Array3, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::training::augment::augment;
use crate::training::callbacks::{
    CosineAnnealing, EarlyStopping, EarlyStoppingDecision, EpochRecord, Mode, ReduceLrOnPlateau,
    TrainingHistory,
};

pub use confidence::McSummary;
pub use metrics::TrainingMetrics;
pub use network::ForecastNetwork;
pub use persistence::{ModelMetadata, PersistenceError};

pub type TrainBackend = Autodiff<NdArray>;
pub type InferBackend = NdArray;

const PREDICT_BATCH: usize = 256;
const MAX_WARMUP_EPOCHS: usize = 20;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model is not fitted")]
    NotFitted,
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
    #[error("empty input")]
    EmptyInput,
    #[error("invalid model parameters: {0}")]
    InvalidParams(String),
    #[error("tensor conversion failed: {0}")]
    Tensor(String),
    #[error("failed to write checkpoint: {0}")]
    Checkpoint(String),
}

/// Architecture and optimizer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub model_name: String,
    pub lstm_units: usize,
    pub num_layers: usize,
    pub dropout_rate: f64,
    pub learning_rate: f64,
    pub attention_heads: usize,
    pub cnn_filters: usize,
    pub l1_reg: f64,
    pub l2_reg: f64,
    pub use_attention: bool,
    pub use_cnn: bool,
    pub use_bidirectional: bool,
    pub use_residual: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model_name: "AdvancedLSTM".to_string(),
            lstm_units: 256,
            num_layers: 4,
            dropout_rate: 0.3,
            learning_rate: 3e-4,
            attention_heads: 12,
            cnn_filters: 64,
            l1_reg: 1e-5,
            l2_reg: 1e-4,
            use_attention: true,
            use_cnn: true,
            use_bidirectional: true,
            use_residual: true,
        }
    }
}

impl ModelParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.lstm_units == 0 || self.num_layers == 0 {
            return Err(ModelError::InvalidParams(
                "lstm_units and num_layers must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ModelError::InvalidParams(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ModelError::InvalidParams(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.use_cnn && self.cnn_filters == 0 {
            return Err(ModelError::InvalidParams("cnn_filters must be positive".to_string()));
        }
        Ok(())
    }
}

/// Training-loop settings.
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub patience: usize,
    pub augment: bool,
    pub augment_factor: f64,
    pub seed: u64,
    /// Best main-stage epoch is written to `checkpoint_dir/best_model.bin`
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 200,
            batch_size: 64,
            patience: 25,
            augment: true,
            augment_factor: 0.1,
            seed: 42,
            checkpoint_dir: None,
        }
    }
}

impl FitOptions {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.epochs == 0 {
            return Err(ModelError::InvalidParams("epochs must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(ModelError::InvalidParams("batch_size must be positive".to_string()));
        }
        Ok(())
    }
}

impl From<&crate::config::TrainingConfig> for FitOptions {
    fn from(config: &crate::config::TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            patience: config.patience,
            augment: config.augment,
            augment_factor: config.augment_factor,
            seed: config.seed,
            checkpoint_dir: None,
        }
    }
}

/// Lifecycle stage of a [`ForecastModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStage {
    Unbuilt,
    Built,
    Fitted,
}

enum NetworkState {
    Unbuilt,
    Built(ForecastNetwork<TrainBackend>),
    Fitted(ForecastNetwork<TrainBackend>),
}

/// Built network together with the shapes it was built for.
pub struct ForecastModel {
    params: ModelParams,
    state: NetworkState,
    input_shape: Option<(usize, usize)>,
    output_shape: Option<(usize, usize)>,
    history: TrainingHistory,
    device: <TrainBackend as Backend>::Device,
}

impl std::fmt::Debug for ForecastModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastModel")
            .field("model_name", &self.params.model_name)
            .field("stage", &self.stage())
            .field("input_shape", &self.input_shape)
            .field("output_shape", &self.output_shape)
            .finish()
    }
}

impl ForecastModel {
    pub fn new(params: ModelParams) -> Self {
        Self {
            params,
            state: NetworkState::Unbuilt,
            input_shape: None,
            output_shape: None,
            history: TrainingHistory::default(),
            device: Default::default(),
        }
    }

    /// Reassemble a fitted model from persisted parts.
    pub(crate) fn from_fitted(
        params: ModelParams,
        network: ForecastNetwork<TrainBackend>,
        input_shape: (usize, usize),
        output_shape: (usize, usize),
        history: TrainingHistory,
    ) -> Self {
        Self {
            params,
            state: NetworkState::Fitted(network),
            input_shape: Some(input_shape),
            output_shape: Some(output_shape),
            history,
            device: Default::default(),
        }
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn stage(&self) -> ModelStage {
        match self.state {
            NetworkState::Unbuilt => ModelStage::Unbuilt,
            NetworkState::Built(_) => ModelStage::Built,
            NetworkState::Fitted(_) => ModelStage::Fitted,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.stage() == ModelStage::Fitted
    }

    /// `(L, F)` the network was built for.
    pub fn input_shape(&self) -> Option<(usize, usize)> {
        self.input_shape
    }

    /// `(H, T)` the network was built for.
    pub fn output_shape(&self) -> Option<(usize, usize)> {
        self.output_shape
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub(crate) fn network(&self) -> Option<&ForecastNetwork<TrainBackend>> {
        match &self.state {
            NetworkState::Unbuilt => None,
            NetworkState::Built(net) | NetworkState::Fitted(net) => Some(net),
        }
    }

    /// Instantiate a fresh network, discarding any previous weights.
    pub fn build(
        &mut self,
        input_shape: (usize, usize),
        output_shape: (usize, usize),
    ) -> Result<(), ModelError> {
        self.params.validate()?;
        if input_shape.0 == 0 || input_shape.1 == 0 || output_shape.0 == 0 || output_shape.1 == 0 {
            return Err(ModelError::InvalidParams(format!(
                "degenerate shapes input={input_shape:?} output={output_shape:?}"
            )));
        }
        let network = ForecastNetwork::new(&self.params, input_shape, output_shape, &self.device);
        info!(
            model = %self.params.model_name,
            parameters = network.num_params(),
            ?input_shape,
            ?output_shape,
            "Built forecast network"
        );
        self.state = NetworkState::Built(network);
        self.input_shape = Some(input_shape);
        self.output_shape = Some(output_shape);
        self.history = TrainingHistory::default();
        Ok(())
    }

    /// Train with a warm-up stage followed by the main stage.
    ///
    /// Without validation data the training metrics are monitored instead.
    /// Training runs on a copy of the network; on error the model keeps its
    /// previous stage and weights.
    pub fn fit(
        &mut self,
        x: &Array3<f32>,
        y: &Array3<f32>,
        validation: Option<(&Array3<f32>, &Array3<f32>)>,
        options: &FitOptions,
    ) -> Result<&TrainingHistory, ModelError> {
        options.validate()?;
        if x.shape()[0] == 0 {
            return Err(ModelError::EmptyInput);
        }
        if x.shape()[0] != y.shape()[0] {
            return Err(ModelError::ShapeMismatch {
                expected: format!("{} target samples", x.shape()[0]),
                actual: format!("{}", y.shape()[0]),
            });
        }
        let input_shape = (x.shape()[1], x.shape()[2]);
        let output_shape = (y.shape()[1], y.shape()[2]);
        let built_shape = self.input_shape;
        match built_shape {
            None => self.build(input_shape, output_shape)?,
            Some(built) if built.1 != input_shape.1 || self.output_shape != Some(output_shape) => {
                return Err(ModelError::ShapeMismatch {
                    expected: format!("{:?} -> {:?}", built, self.output_shape),
                    actual: format!("{input_shape:?} -> {output_shape:?}"),
                });
            }
            Some(_) => {}
        }
        if let Some((vx, vy)) = validation {
            self.check_features(vx)?;
            if vx.shape()[0] != vy.shape()[0] {
                return Err(ModelError::ShapeMismatch {
                    expected: format!("{} validation targets", vx.shape()[0]),
                    actual: format!("{}", vy.shape()[0]),
                });
            }
        }
        let validation = validation.filter(|(vx, _)| vx.shape()[0] > 0);

        let network = match &self.state {
            NetworkState::Built(net) | NetworkState::Fitted(net) => net.clone(),
            NetworkState::Unbuilt => {
                return Err(ModelError::InvalidParams("network was not built".to_string()));
            }
        };
        let (network, history) = self.train(network, x, y, validation, options)?;
        self.state = NetworkState::Fitted(network);
        self.history = history;

        if let Some((vx, vy)) = validation {
            let pred = self.predict(vx)?;
            let accuracy = metrics::accuracy_within(vy.view(), pred.view(), 0.10);
            info!(
                val_accuracy_10_percent = accuracy * 100.0,
                "Final validation accuracy (within 10%)"
            );
        }
        Ok(&self.history)
    }

    fn train(
        &self,
        mut network: ForecastNetwork<TrainBackend>,
        x: &Array3<f32>,
        y: &Array3<f32>,
        validation: Option<(&Array3<f32>, &Array3<f32>)>,
        options: &FitOptions,
    ) -> Result<(ForecastNetwork<TrainBackend>, TrainingHistory), ModelError> {
        TrainBackend::seed(options.seed);
        let mut rng = StdRng::seed_from_u64(options.seed);

        let (x_train, y_train) = if options.augment {
            augment(x, y, options.augment_factor, &mut rng)
        } else {
            (x.clone(), y.clone())
        };

        let mut optim = AdamWConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(1e-7)
            .with_weight_decay(1e-4)
            .init::<TrainBackend, ForecastNetwork<TrainBackend>>();

        let mut history = TrainingHistory::default();
        let warmup_epochs = MAX_WARMUP_EPOCHS.min(options.epochs / 4);
        let main_epochs = options.epochs - warmup_epochs;
        let mut plateau = ReduceLrOnPlateau::new(
            self.params.learning_rate,
            0.7,
            (options.patience / 3).max(1),
            5,
            1e-8,
        );

        info!(
            samples = x_train.shape()[0],
            warmup_epochs, main_epochs, "Starting training"
        );

        // Warm-up: half batch, plateau reduction only
        let warmup_batch = (options.batch_size / 2).max(1);
        for epoch in 0..warmup_epochs {
            let lr = plateau.lr();
            let (net, record) = self.run_epoch(
                network, &mut optim, &x_train, &y_train, validation, warmup_batch, lr, &mut rng,
            )?;
            network = net;
            plateau.step(record.val_loss.unwrap_or(record.loss));
            debug!(stage = "warmup", epoch, loss = record.loss, val_loss = ?record.val_loss, lr);
            history.push(record);
        }

        let mut early = EarlyStopping::new(Mode::Max, options.patience);
        let cosine = CosineAnnealing::new(options.epochs);
        let mut best: Option<ForecastNetwork<TrainBackend>> = None;
        for epoch in 0..main_epochs {
            let lr = (plateau.lr() * cosine.multiplier(epoch)).max(1e-12);
            let (net, record) = self.run_epoch(
                network,
                &mut optim,
                &x_train,
                &y_train,
                validation,
                options.batch_size,
                lr,
                &mut rng,
            )?;
            network = net;
            plateau.step(record.val_loss.unwrap_or(record.loss));
            debug!(
                stage = "main",
                epoch,
                loss = record.loss,
                val_loss = ?record.val_loss,
                val_accuracy = ?record.val_accuracy_10_percent,
                lr
            );
            let monitored = record
                .val_accuracy_10_percent
                .unwrap_or(record.accuracy_10_percent);
            history.push(record);

            match early.step(epoch, monitored) {
                EarlyStoppingDecision::Improved => {
                    if let Some(dir) = &options.checkpoint_dir {
                        checkpoint(&network, dir)?;
                    }
                    best = Some(network.clone());
                }
                EarlyStoppingDecision::Continue => {}
                EarlyStoppingDecision::Stop => {
                    info!(epoch, best = ?early.best(), "Early stopping");
                    break;
                }
            }
        }
        if let Some(best) = best {
            network = best;
        }
        Ok((network, history))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_epoch<O>(
        &self,
        mut network: ForecastNetwork<TrainBackend>,
        optim: &mut O,
        x: &Array3<f32>,
        y: &Array3<f32>,
        validation: Option<(&Array3<f32>, &Array3<f32>)>,
        batch_size: usize,
        lr: f64,
        rng: &mut StdRng,
    ) -> Result<(ForecastNetwork<TrainBackend>, EpochRecord), ModelError>
    where
        O: Optimizer<ForecastNetwork<TrainBackend>, TrainBackend>,
    {
        let n = x.shape()[0];
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);

        let mut loss_sum = 0.0;
        let mut batches = 0usize;
        let mut seen_pred: Vec<f32> = Vec::with_capacity(y.len());
        let mut seen_true: Vec<f32> = Vec::with_capacity(y.len());

        for chunk in order.chunks(batch_size) {
            let xb = x.select(Axis(0), chunk);
            let yb = y.select(Axis(0), chunk);
            let input = to_tensor::<TrainBackend>(&xb, &self.device);
            let target = to_tensor::<TrainBackend>(&yb, &self.device);

            let pred = network.forward(input, true);
            let loss = network::huber_loss(pred.clone(), target, metrics::HUBER_DELTA)
                + network.weight_penalty(self.params.l1_reg, self.params.l2_reg);

            loss_sum += loss.clone().into_scalar().elem::<f64>();
            batches += 1;
            seen_pred.extend(to_vec(pred.inner())?);
            seen_true.extend(yb.iter().copied());

            let grads = GradientsParams::from_grads(loss.backward(), &network);
            network = optim.step(lr, network, grads);
        }

        let shape = (n, y.shape()[1], y.shape()[2]);
        let pred = Array3::from_shape_vec(shape, seen_pred)
            .map_err(|e| ModelError::Tensor(e.to_string()))?;
        let truth = Array3::from_shape_vec(shape, seen_true)
            .map_err(|e| ModelError::Tensor(e.to_string()))?;
        let train = TrainingMetrics::compute(truth.view(), pred.view());

        let (val_loss, val_accuracy) = match validation {
            Some((vx, vy)) => {
                let inference = network.valid();
                let penalty = inference
                    .weight_penalty(self.params.l1_reg, self.params.l2_reg)
                    .into_scalar()
                    .elem::<f64>();
                let vpred = predict_batched(&inference, vx, false, &self.device)?;
                (
                    Some(metrics::huber(vy.view(), vpred.view()) + penalty),
                    Some(metrics::accuracy_within(vy.view(), vpred.view(), 0.10)),
                )
            }
            None => (None, None),
        };

        let record = EpochRecord {
            loss: loss_sum / batches.max(1) as f64,
            val_loss,
            accuracy_10_percent: train.accuracy_10_percent,
            val_accuracy_10_percent: val_accuracy,
            r_squared: train.r_squared,
            learning_rate: lr,
        };
        Ok((network, record))
    }

    fn check_features(&self, x: &Array3<f32>) -> Result<(), ModelError> {
        let Some((_, features)) = self.input_shape else {
            return Err(ModelError::NotFitted);
        };
        if x.shape()[2] != features {
            return Err(ModelError::ShapeMismatch {
                expected: format!("{features} features"),
                actual: format!("{} features", x.shape()[2]),
            });
        }
        Ok(())
    }

    fn fitted_network(&self) -> Result<ForecastNetwork<InferBackend>, ModelError> {
        match &self.state {
            NetworkState::Fitted(net) => Ok(net.valid()),
            _ => Err(ModelError::NotFitted),
        }
    }

    /// Deterministic prediction of shape `(n, H, T)`.
    pub fn predict(&self, x: &Array3<f32>) -> Result<Array3<f32>, ModelError> {
        let network = self.fitted_network()?;
        self.check_features(x)?;
        predict_batched(&network, x, false, &self.device)
    }

    /// Monte-Carlo dropout prediction: element-wise mean and population
    /// standard deviation over `n_samples` stochastic passes.
    pub fn predict_with_uncertainty(
        &self,
        x: &Array3<f32>,
        n_samples: usize,
    ) -> Result<McSummary, ModelError> {
        let network = self.fitted_network()?;
        self.check_features(x)?;
        let samples = (0..n_samples.max(1))
            .map(|_| predict_batched(&network, x, true, &self.device))
            .collect::<Result<Vec<_>, _>>()?;
        McSummary::from_samples(&samples).ok_or(ModelError::EmptyInput)
    }
}

fn checkpoint(network: &ForecastNetwork<TrainBackend>, dir: &std::path::Path) -> Result<(), ModelError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    std::fs::create_dir_all(dir)
        .map_err(|e| ModelError::Checkpoint(format!("{}: {e}", dir.display())))?;
    network
        .clone()
        .save_file(dir.join("best_model"), &recorder)
        .map_err(|e| ModelError::Checkpoint(format!("{}: {e:?}", dir.display())))
}

fn to_tensor<B: Backend>(x: &Array3<f32>, device: &B::Device) -> Tensor<B, 3> {
    let (n, l, f) = x.dim();
    let values: Vec<f32> = x.iter().copied().collect();
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([n, l, f])
}

fn to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f32>, ModelError> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ModelError::Tensor(format!("{e:?}")))
}

fn predict_batched<B: Backend>(
    network: &ForecastNetwork<B>,
    x: &Array3<f32>,
    stochastic: bool,
    device: &B::Device,
) -> Result<Array3<f32>, ModelError> {
    let n = x.shape()[0];
    if n == 0 {
        return Err(ModelError::EmptyInput);
    }
    let mut values = Vec::new();
    let mut out_shape = (0, 0);
    for start in (0..n).step_by(PREDICT_BATCH) {
        let end = (start + PREDICT_BATCH).min(n);
        let batch = x.slice(ndarray::s![start..end, .., ..]).to_owned();
        let out = network.forward(to_tensor::<B>(&batch, device), stochastic);
        let [_, h, t] = out.dims();
        out_shape = (h, t);
        values.extend(to_vec(out)?);
    }
    Array3::from_shape_vec((n, out_shape.0, out_shape.1), values)
        .map_err(|e| ModelError::Tensor(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_params() -> ModelParams {
        ModelParams {
            lstm_units: 4,
            num_layers: 1,
            attention_heads: 2,
            cnn_filters: 4,
            dropout_rate: 0.1,
            learning_rate: 1e-2,
            ..ModelParams::default()
        }
    }

    fn tiny_options() -> FitOptions {
        FitOptions {
            epochs: 4,
            batch_size: 4,
            patience: 3,
            augment: false,
            ..FitOptions::default()
        }
    }

    fn data(n: usize) -> (Array3<f32>, Array3<f32>) {
        let x = Array3::from_shape_fn((n, 5, 3), |(i, t, f)| ((i + t + f) % 5) as f32 * 0.2);
        let y = Array3::from_shape_fn((n, 2, 1), |(i, h, _)| 10.0 + ((i + h) % 3) as f32);
        (x, y)
    }

    // ==================== Lifecycle ====================

    #[test]
    fn test_predict_before_fit_fails() {
        let model = ForecastModel::new(tiny_params());
        let (x, _) = data(2);
        assert!(matches!(model.predict(&x), Err(ModelError::NotFitted)));
        assert_eq!(model.stage(), ModelStage::Unbuilt);
    }

    #[test]
    fn test_build_then_fit_changes_stage() {
        let mut model = ForecastModel::new(tiny_params());
        model.build((5, 3), (2, 1)).unwrap();
        assert_eq!(model.stage(), ModelStage::Built);

        let (x, y) = data(8);
        let history = model.fit(&x, &y, None, &tiny_options()).unwrap();
        assert_eq!(history.epochs(), 4);
        assert!(history.val_loss.iter().all(Option::is_none));
        assert!(model.is_fitted());
    }

    #[test]
    fn test_fit_builds_from_data_shapes() {
        let mut model = ForecastModel::new(tiny_params());
        let (x, y) = data(8);
        let (vx, vy) = data(4);
        model.fit(&x, &y, Some((&vx, &vy)), &tiny_options()).unwrap();

        assert_eq!(model.input_shape(), Some((5, 3)));
        assert_eq!(model.output_shape(), Some((2, 1)));
        let pred = model.predict(&vx).unwrap();
        assert_eq!(pred.shape(), &[4, 2, 1]);
        assert!(pred.iter().all(|v| v.is_finite()));
        assert!(model.history().val_loss.iter().all(Option::is_some));
    }

    #[test]
    fn test_feature_count_mismatch() {
        let mut model = ForecastModel::new(tiny_params());
        let (x, y) = data(8);
        model.fit(&x, &y, None, &tiny_options()).unwrap();

        let wrong = Array3::<f32>::zeros((2, 5, 4));
        assert!(matches!(model.predict(&wrong), Err(ModelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut model = ForecastModel::new(ModelParams {
            dropout_rate: 1.0,
            ..tiny_params()
        });
        assert!(matches!(model.build((5, 3), (1, 1)), Err(ModelError::InvalidParams(_))));
    }

    // ==================== Uncertainty ====================

    #[test]
    fn test_mc_dropout_summary_shape() {
        let mut model = ForecastModel::new(tiny_params());
        let (x, y) = data(8);
        model.fit(&x, &y, None, &tiny_options()).unwrap();

        let summary = model.predict_with_uncertainty(&x, 5).unwrap();
        assert_eq!(summary.mean.shape(), &[8, 2, 1]);
        assert_eq!(summary.std.shape(), &[8, 2, 1]);
        assert!(summary.std.iter().all(|&s| s >= 0.0));
    }

    #[test]
    fn test_checkpoint_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = ForecastModel::new(tiny_params());
        let (x, y) = data(8);
        let options = FitOptions {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..tiny_options()
        };
        model.fit(&x, &y, None, &options).unwrap();
        assert!(dir.path().join("best_model.bin").exists());
    }

    #[test]
    fn test_zero_epochs_or_batch_size_rejected() {
        let mut model = ForecastModel::new(tiny_params());
        let (x, y) = data(8);
        for options in [
            FitOptions { epochs: 0, ..tiny_options() },
            FitOptions { batch_size: 0, ..tiny_options() },
        ] {
            assert!(matches!(
                model.fit(&x, &y, None, &options),
                Err(ModelError::InvalidParams(_))
            ));
            assert_eq!(model.stage(), ModelStage::Unbuilt);
        }
    }

    #[test]
    fn test_failed_checkpoint_keeps_built_network() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();

        let mut model = ForecastModel::new(tiny_params());
        let (x, y) = data(8);
        let options = FitOptions {
            checkpoint_dir: Some(blocker.join("checkpoints")),
            ..tiny_options()
        };
        assert!(matches!(
            model.fit(&x, &y, None, &options),
            Err(ModelError::Checkpoint(_))
        ));
        assert_eq!(model.stage(), ModelStage::Built);
        assert_eq!(model.input_shape(), Some((5, 3)));

        model.fit(&x, &y, None, &tiny_options()).unwrap();
        assert!(model.is_fitted());
    }

    #[test]
    fn test_failed_refit_keeps_fitted_weights() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();

        let mut model = ForecastModel::new(tiny_params());
        let (x, y) = data(8);
        model.fit(&x, &y, None, &tiny_options()).unwrap();
        let before = model.predict(&x).unwrap();
        let epochs_before = model.history().epochs();

        let options = FitOptions {
            checkpoint_dir: Some(blocker.clone()),
            seed: 7,
            ..tiny_options()
        };
        assert!(model.fit(&x, &y, None, &options).is_err());
        assert!(model.is_fitted());
        assert_eq!(model.history().epochs(), epochs_before);
        assert_eq!(model.predict(&x).unwrap(), before);
    }
}
