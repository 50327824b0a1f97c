//! Outlier capping (IQR) and replacement (z-score) with replayable bounds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::series;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutlierMethod {
    #[default]
    #[serde(rename = "iqr")]
    Iqr,
    #[serde(rename = "zscore")]
    ZScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZScoreStats {
    pub mean: f64,
    pub std: f64,
    pub median: f64,
}

/// Per-column thresholds learned on the training data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum OutlierState {
    Iqr {
        factor: f64,
        bounds: BTreeMap<String, (f64, f64)>,
    },
    Zscore {
        factor: f64,
        stats: BTreeMap<String, ZScoreStats>,
    },
}

impl OutlierState {
    /// Learn thresholds for every column not in `exclude`.
    pub fn fit(frame: &Frame, method: OutlierMethod, factor: f64, exclude: &[String]) -> Self {
        let columns = frame
            .names()
            .filter(|n| !exclude.iter().any(|e| e.as_str() == *n))
            .filter_map(|n| frame.column(n).map(|c| (n, c)));
        match method {
            OutlierMethod::Iqr => {
                let bounds = columns
                    .filter_map(|(name, values)| {
                        let q1 = series::quantile(values, 0.25);
                        let q3 = series::quantile(values, 0.75);
                        if q1.is_nan() || q3.is_nan() {
                            return None;
                        }
                        let iqr = q3 - q1;
                        Some((name.to_string(), (q1 - factor * iqr, q3 + factor * iqr)))
                    })
                    .collect();
                OutlierState::Iqr { factor, bounds }
            }
            OutlierMethod::ZScore => {
                let stats = columns
                    .filter_map(|(name, values)| {
                        let mean = series::mean(values);
                        if mean.is_nan() {
                            return None;
                        }
                        let stats = ZScoreStats {
                            mean,
                            std: series::std_dev(values, 0),
                            median: series::median(values),
                        };
                        Some((name.to_string(), stats))
                    })
                    .collect();
                OutlierState::Zscore { factor, stats }
            }
        }
    }

    /// Apply the stored thresholds. Row count never changes and NaN stays NaN.
    pub fn apply(&self, mut frame: Frame) -> (Frame, usize) {
        let mut handled = 0usize;
        match self {
            OutlierState::Iqr { bounds, .. } => {
                for (name, &(lo, hi)) in bounds {
                    let Some(values) = frame.column(name) else {
                        continue;
                    };
                    handled += values.iter().filter(|&&v| v < lo || v > hi).count();
                    let capped = values.iter().map(|&v| if v.is_nan() { v } else { v.clamp(lo, hi) }).collect();
                    frame.set(name.clone(), capped);
                }
            }
            OutlierState::Zscore { factor, stats } => {
                for (name, s) in stats {
                    let Some(values) = frame.column(name) else {
                        continue;
                    };
                    if !(s.std > 0.0) {
                        continue;
                    }
                    let replaced: Vec<f64> = values
                        .iter()
                        .map(|&v| {
                            if ((v - s.mean) / s.std).abs() > *factor {
                                handled += 1;
                                s.median
                            } else {
                                v
                            }
                        })
                        .collect();
                    frame.set(name.clone(), replaced);
                }
            }
        }
        (frame, handled)
    }
}

/// Fit thresholds on `frame` and apply them in one pass.
pub fn detect_and_handle_outliers(
    frame: Frame,
    method: OutlierMethod,
    factor: f64,
    exclude: &[String],
) -> (Frame, OutlierState) {
    let state = OutlierState::fit(&frame, method, factor, exclude);
    let (frame, handled) = state.apply(frame);
    tracing::info!(?method, factor, handled, "Outlier handling complete");
    (frame, state)
}
