//! Learning-rate schedules, early stopping and per-epoch history.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Whether a monitored metric should go down or up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Min,
    Max,
}

impl Mode {
    fn initial(self) -> f64 {
        match self {
            Mode::Min => f64::INFINITY,
            Mode::Max => f64::NEG_INFINITY,
        }
    }

    fn improved(self, current: f64, best: f64, min_delta: f64) -> bool {
        match self {
            Mode::Min => current < best - min_delta,
            Mode::Max => current > best + min_delta,
        }
    }
}

// =============================================================================
// EarlyStopping
// =============================================================================

/// Stops training when the monitored metric has not improved for `patience`
/// epochs. The caller keeps the best weights and restores them on stop.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    mode: Mode,
    patience: usize,
    min_delta: f64,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

/// What the trainer should do after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStoppingDecision {
    /// New best value; snapshot the weights
    Improved,
    Continue,
    Stop,
}

impl EarlyStopping {
    pub fn new(mode: Mode, patience: usize) -> Self {
        Self {
            mode,
            patience,
            min_delta: 0.0,
            best: mode.initial(),
            best_epoch: None,
            wait: 0,
        }
    }

    pub fn step(&mut self, epoch: usize, metric: f64) -> EarlyStoppingDecision {
        if metric.is_finite() && self.mode.improved(metric, self.best, self.min_delta) {
            self.best = metric;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return EarlyStoppingDecision::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience.max(1) {
            EarlyStoppingDecision::Stop
        } else {
            EarlyStoppingDecision::Continue
        }
    }

    pub fn best(&self) -> Option<(usize, f64)> {
        self.best_epoch.map(|e| (e, self.best))
    }
}

// =============================================================================
// ReduceLrOnPlateau
// =============================================================================

/// Multiplies the learning rate by `factor` once the monitored loss has not
/// improved for `patience` epochs, then waits `cooldown` epochs.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    cooldown: usize,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
    cooldown_counter: usize,
    lr: f64,
}

impl ReduceLrOnPlateau {
    pub fn new(initial_lr: f64, factor: f64, patience: usize, cooldown: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            cooldown,
            min_lr,
            min_delta: 1e-4,
            best: f64::INFINITY,
            wait: 0,
            cooldown_counter: 0,
            lr: initial_lr,
        }
    }

    /// Current (possibly reduced) learning rate.
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Feed the epoch's loss; returns the learning rate for the next epoch.
    pub fn step(&mut self, loss: f64) -> f64 {
        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.wait = 0;
        }

        if loss.is_finite() && Mode::Min.improved(loss, self.best, self.min_delta) {
            self.best = loss;
            self.wait = 0;
        } else if self.cooldown_counter == 0 {
            self.wait += 1;
            if self.wait >= self.patience.max(1) && self.lr > self.min_lr {
                let new_lr = (self.lr * self.factor).max(self.min_lr);
                tracing::info!(old = self.lr, new = new_lr, "Reducing learning rate on plateau");
                self.lr = new_lr;
                self.cooldown_counter = self.cooldown;
                self.wait = 0;
            }
        }
        self.lr
    }
}

// =============================================================================
// CosineAnnealing
// =============================================================================

/// `0.5 * (1 + cos(pi * epoch / total))` multiplier over the full run.
#[derive(Debug, Clone, Copy)]
pub struct CosineAnnealing {
    total_epochs: usize,
}

impl CosineAnnealing {
    pub fn new(total_epochs: usize) -> Self {
        Self { total_epochs }
    }

    pub fn multiplier(&self, epoch: usize) -> f64 {
        if self.total_epochs == 0 {
            return 1.0;
        }
        0.5 * (1.0 + (PI * epoch as f64 / self.total_epochs as f64).cos())
    }
}

// =============================================================================
// TrainingHistory
// =============================================================================

/// One row per epoch across both training stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub loss: Vec<f64>,
    pub val_loss: Vec<Option<f64>>,
    pub accuracy_10_percent: Vec<f64>,
    pub val_accuracy_10_percent: Vec<Option<f64>>,
    pub r_squared: Vec<f64>,
    pub learning_rate: Vec<f64>,
}

/// Values recorded for a single epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    pub loss: f64,
    pub val_loss: Option<f64>,
    pub accuracy_10_percent: f64,
    pub val_accuracy_10_percent: Option<f64>,
    pub r_squared: f64,
    pub learning_rate: f64,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpochRecord) {
        self.loss.push(record.loss);
        self.val_loss.push(record.val_loss);
        self.accuracy_10_percent.push(record.accuracy_10_percent);
        self.val_accuracy_10_percent
            .push(record.val_accuracy_10_percent);
        self.r_squared.push(record.r_squared);
        self.learning_rate.push(record.learning_rate);
    }

    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loss.is_empty()
    }
}
