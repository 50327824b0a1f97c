//! Training-time metrics computed on flattened predictions.

use ndarray::{ArrayView3, Zip};

/// Replacement for near-zero truth values in relative errors.
pub const EPSILON: f64 = 1e-7;
pub const HUBER_DELTA: f64 = 1.0;

/// Fraction of elements whose relative error is at most `threshold`.
///
/// Truth values with `|y| < EPSILON` are replaced by `EPSILON`.
pub fn accuracy_within(y_true: ArrayView3<f32>, y_pred: ArrayView3<f32>, threshold: f64) -> f64 {
    let total = y_true.len();
    if total == 0 {
        return 0.0;
    }
    let mut hits = 0usize;
    Zip::from(&y_true).and(&y_pred).for_each(|&t, &p| {
        let t = f64::from(t);
        let safe = if t.abs() < EPSILON { EPSILON } else { t };
        if ((t - f64::from(p)) / safe).abs() <= threshold {
            hits += 1;
        }
    });
    hits as f64 / total as f64
}

/// `1 - SS_res / (SS_tot + EPSILON)` over all elements.
pub fn r_squared(y_true: ArrayView3<f32>, y_pred: ArrayView3<f32>) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let mean = y_true.iter().map(|&v| f64::from(v)).sum::<f64>() / y_true.len() as f64;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    Zip::from(&y_true).and(&y_pred).for_each(|&t, &p| {
        ss_res += (f64::from(t) - f64::from(p)).powi(2);
        ss_tot += (f64::from(t) - mean).powi(2);
    });
    1.0 - ss_res / (ss_tot + EPSILON)
}

pub fn mae(y_true: ArrayView3<f32>, y_pred: ArrayView3<f32>) -> f64 {
    mean_of(y_true, y_pred, |e| e.abs())
}

pub fn mse(y_true: ArrayView3<f32>, y_pred: ArrayView3<f32>) -> f64 {
    mean_of(y_true, y_pred, |e| e * e)
}

/// Mean Huber loss with `HUBER_DELTA`.
pub fn huber(y_true: ArrayView3<f32>, y_pred: ArrayView3<f32>) -> f64 {
    mean_of(y_true, y_pred, |e| {
        let a = e.abs();
        let q = a.min(HUBER_DELTA);
        0.5 * q * q + HUBER_DELTA * (a - q)
    })
}

fn mean_of(y_true: ArrayView3<f32>, y_pred: ArrayView3<f32>, f: impl Fn(f64) -> f64) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let mut sum = 0.0;
    Zip::from(&y_true).and(&y_pred).for_each(|&t, &p| {
        sum += f(f64::from(t) - f64::from(p));
    });
    sum / y_true.len() as f64
}

/// Snapshot of the training metrics for one prediction set.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrainingMetrics {
    pub loss: f64,
    pub mae: f64,
    pub mse: f64,
    pub accuracy_5_percent: f64,
    pub accuracy_10_percent: f64,
    pub accuracy_15_percent: f64,
    pub accuracy_20_percent: f64,
    pub r_squared: f64,
}

impl TrainingMetrics {
    pub fn compute(y_true: ArrayView3<f32>, y_pred: ArrayView3<f32>) -> Self {
        Self {
            loss: huber(y_true, y_pred),
            mae: mae(y_true, y_pred),
            mse: mse(y_true, y_pred),
            accuracy_5_percent: accuracy_within(y_true, y_pred, 0.05),
            accuracy_10_percent: accuracy_within(y_true, y_pred, 0.10),
            accuracy_15_percent: accuracy_within(y_true, y_pred, 0.15),
            accuracy_20_percent: accuracy_within(y_true, y_pred, 0.20),
            r_squared: r_squared(y_true, y_pred),
        }
    }
}
