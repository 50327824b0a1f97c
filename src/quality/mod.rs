//! Data quality enhancement: outlier handling, smoothing, robust statistics,
//! interactions, lag features, imputation and scaling.
//!
//! [`DataQualityEnhancer::fit_transform`] learns every piece of state the
//! pipeline needs. [`DataQualityEnhancer::transform_new_data`] replays that
//! state on unseen rows without refitting anything, so the same input always
//! produces bit-identical output.

pub mod derived;
pub mod outliers;
pub mod scaler;
pub mod smoothing;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{CALENDAR_COLUMNS, Frame, FrameError};
use crate::series;

pub use derived::{MonthlyMeans, add_interaction_features, add_lag_difference_features, add_robust_features};
pub use outliers::{OutlierMethod, OutlierState, detect_and_handle_outliers};
pub use scaler::{FittedScaler, ScalingMethod};
pub use smoothing::{savgol_filter, smooth_time_series};

/// Never capped or scaled besides the calendar fields.
const SITE_COLUMN: &str = "site_id";

#[derive(Debug, Error)]
pub enum QualityError {
    #[error("data quality enhancer used before fit")]
    NotFitted,
    #[error("new data is missing fitted columns: {}", missing.join(", "))]
    FeatureMismatch { missing: Vec<String> },
    #[error("no rows to fit on")]
    EmptyInput,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Which enhancement steps run and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityOptions {
    pub handle_outliers: bool,
    pub outlier_method: OutlierMethod,
    pub outlier_factor: f64,
    pub smooth: bool,
    pub smoothing_window: usize,
    pub smoothing_polyorder: usize,
    pub robust_stats: bool,
    pub interactions: bool,
    pub lags: bool,
    pub scaling_method: ScalingMethod,
}

impl Default for QualityOptions {
    fn default() -> Self {
        Self {
            handle_outliers: true,
            outlier_method: OutlierMethod::Iqr,
            outlier_factor: 2.0,
            smooth: true,
            smoothing_window: 5,
            smoothing_polyorder: 2,
            robust_stats: true,
            interactions: true,
            lags: true,
            scaling_method: ScalingMethod::Robust,
        }
    }
}

/// Everything learned by a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityState {
    pub options: QualityOptions,
    pub targets: Vec<String>,
    pub outliers: Option<OutlierState>,
    pub monthly_means: Option<MonthlyMeans>,
    /// Output columns in order with their imputation medians
    pub medians: Vec<(String, f64)>,
    pub scaler: FittedScaler,
}

impl QualityState {
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.medians.iter().map(|(n, _)| n.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub original_shape: (usize, usize),
    pub final_shape: (usize, usize),
    pub features_added: isize,
    /// Share of missing or infinite cells before imputation
    pub missing_values_pct: f64,
}

#[derive(Debug, Clone)]
pub struct DataQualityEnhancer {
    options: QualityOptions,
    targets: Vec<String>,
    state: Option<QualityState>,
    report: Option<QualityReport>,
}

impl DataQualityEnhancer {
    pub fn new(options: QualityOptions, targets: Vec<String>) -> Self {
        Self {
            options,
            targets,
            state: None,
            report: None,
        }
    }

    /// Rebuild a fitted enhancer from persisted state.
    pub fn from_state(state: QualityState) -> Self {
        Self {
            options: state.options.clone(),
            targets: state.targets.clone(),
            state: Some(state),
            report: None,
        }
    }

    pub fn state(&self) -> Option<&QualityState> {
        self.state.as_ref()
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    /// Summary of the last fit.
    pub fn quality_report(&self) -> Option<&QualityReport> {
        self.report.as_ref()
    }

    fn untouched_columns(&self) -> Vec<String> {
        CALENDAR_COLUMNS
            .iter()
            .copied()
            .chain([SITE_COLUMN])
            .map(str::to_string)
            .chain(self.targets.iter().cloned())
            .collect()
    }

    pub fn fit_transform(&mut self, frame: Frame) -> Result<Frame, QualityError> {
        self.fit_transform_segments(vec![frame])?
            .pop()
            .ok_or(QualityError::EmptyInput)
    }

    /// Fit on several independent time series at once.
    ///
    /// Each stateful step is fitted on all segments together, while row-wise
    /// history (smoothing, rolling windows, lags) never crosses a segment.
    pub fn fit_transform_segments(&mut self, segments: Vec<Frame>) -> Result<Vec<Frame>, QualityError> {
        let combined = Frame::concat(&segments)?;
        if combined.is_empty() {
            return Err(QualityError::EmptyInput);
        }
        let original_shape = (combined.len(), combined.width());
        let untouched = self.untouched_columns();
        tracing::info!(rows = original_shape.0, columns = original_shape.1, "Starting data quality enhancement");

        // 1. Outliers
        let outliers = self.options.handle_outliers.then(|| {
            OutlierState::fit(
                &combined,
                self.options.outlier_method,
                self.options.outlier_factor,
                &untouched,
            )
        });
        let segments: Vec<Frame> = segments
            .into_iter()
            .map(|s| match &outliers {
                Some(state) => state.apply(s).0,
                None => s,
            })
            .collect();

        // 4 is fitted up front; it only needs the capped temperature column.
        let monthly_means = if self.options.interactions {
            MonthlyMeans::fit(&Frame::concat(&segments)?)
        } else {
            None
        };

        // 2-5. Row-wise derivations per segment
        let mut segments: Vec<Frame> = segments
            .into_iter()
            .map(|s| self.derive(s, monthly_means.as_ref()))
            .collect();

        // 6. Imputation medians over every segment
        let combined = Frame::concat(&segments)?;
        let missing_values_pct =
            100.0 * combined.non_finite_count() as f64 / (combined.len() * combined.width()).max(1) as f64;
        let medians: Vec<(String, f64)> = combined
            .names()
            .map(|name| {
                let finite: Vec<f64> = combined
                    .column(name)
                    .unwrap_or_default()
                    .iter()
                    .map(|&v| if v.is_finite() { v } else { f64::NAN })
                    .collect();
                let median = series::median(&finite);
                (name.to_string(), if median.is_nan() { 0.0 } else { median })
            })
            .collect();

        for segment in &mut segments {
            for (name, _) in &medians {
                if !segment.contains(name) {
                    segment.set(name.clone(), vec![f64::NAN; segment.len()]);
                }
            }
            *segment = impute(select_columns(segment, &medians), &medians);
        }

        // 7. Scaling
        let scaler = FittedScaler::fit(&Frame::concat(&segments)?, self.options.scaling_method, &untouched);
        for segment in &mut segments {
            scaler.transform(segment)?;
        }

        let final_shape = (
            segments.iter().map(Frame::len).sum(),
            medians.len(),
        );
        let report = QualityReport {
            original_shape,
            final_shape,
            features_added: final_shape.1 as isize - original_shape.1 as isize,
            missing_values_pct,
        };
        tracing::info!(
            original_shape = ?report.original_shape,
            final_shape = ?report.final_shape,
            features_added = report.features_added,
            missing_pct = report.missing_values_pct,
            "Data quality enhancement completed"
        );

        self.state = Some(QualityState {
            options: self.options.clone(),
            targets: self.targets.clone(),
            outliers,
            monthly_means,
            medians,
            scaler,
        });
        self.report = Some(report);
        Ok(segments)
    }

    /// Replay the fitted pipeline on new rows.
    pub fn transform_new_data(&self, frame: Frame) -> Result<Frame, QualityError> {
        let state = self.state.as_ref().ok_or(QualityError::NotFitted)?;

        let frame = match &state.outliers {
            Some(outliers) => outliers.apply(frame).0,
            None => frame,
        };
        let mut frame = self.derive(frame, state.monthly_means.as_ref());

        let missing: Vec<String> = state
            .columns()
            .filter(|name| !frame.contains(name))
            .filter(|name| !state.targets.iter().any(|t| t == name))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(QualityError::FeatureMismatch { missing });
        }
        for target in &state.targets {
            if !frame.contains(target) {
                frame.set(target.clone(), vec![f64::NAN; frame.len()]);
            }
        }

        let mut frame = impute(select_columns(&frame, &state.medians), &state.medians);
        state
            .scaler
            .transform(&mut frame)
            .map_err(|e| QualityError::FeatureMismatch {
                missing: vec![e.to_string()],
            })?;
        Ok(frame)
    }

    /// Steps 2-5, using already-fitted monthly means.
    fn derive(&self, frame: Frame, monthly: Option<&MonthlyMeans>) -> Frame {
        let mut frame = frame;
        if self.options.smooth {
            frame = smooth_time_series(frame, self.options.smoothing_window, self.options.smoothing_polyorder);
        }
        if self.options.robust_stats {
            frame = add_robust_features(frame);
        }
        if self.options.interactions {
            frame = add_interaction_features(frame, monthly);
        }
        if self.options.lags {
            frame = add_lag_difference_features(frame);
        }
        frame
    }
}

fn select_columns(frame: &Frame, medians: &[(String, f64)]) -> Frame {
    let names: Vec<&str> = medians.iter().map(|(n, _)| n.as_str()).collect();
    // Every name was checked or inserted by the caller.
    frame.select(&names).unwrap_or_else(|_| frame.clone())
}

/// ±inf becomes NaN, then NaN becomes the fitted median.
fn impute(mut frame: Frame, medians: &[(String, f64)]) -> Frame {
    for (name, median) in medians {
        let median = *median;
        // Columns come from `select_columns`, so the lookup cannot fail.
        let _ = frame.map_column(name, |v| if v.is_finite() { v } else { median });
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(rows: usize, offset: f64) -> Frame {
        let hours: Vec<f64> = (0..rows).map(|i| (i % 24) as f64).collect();
        let days: Vec<f64> = (0..rows).map(|i| (1 + i / 24) as f64).collect();
        Frame::from_columns([
            ("year", vec![2024.0; rows]),
            ("month", vec![3.0; rows]),
            ("day", days),
            ("hour", hours.clone()),
            (
                "O3_forecast",
                hours.iter().map(|h| 40.0 + offset + (h / 3.0).sin() * 10.0).collect(),
            ),
            (
                "NO2_forecast",
                hours.iter().map(|h| 60.0 + offset + (h / 5.0).cos() * 8.0).collect(),
            ),
            ("T_forecast", hours.iter().map(|h| 295.0 + h * 0.3).collect()),
            ("q_forecast", vec![0.01; rows]),
            ("wind_speed", hours.iter().map(|h| 1.0 + h * 0.1).collect()),
            ("NO2_target", hours.iter().map(|h| 50.0 + h).collect()),
        ])
        .unwrap()
    }

    fn enhancer() -> DataQualityEnhancer {
        DataQualityEnhancer::new(QualityOptions::default(), vec!["NO2_target".to_string()])
    }

    // ==================== Fit ====================

    #[test]
    fn test_fit_output_is_finite() {
        let mut e = enhancer();
        let out = e.fit_transform(raw(72, 0.0)).unwrap();
        assert_eq!(out.len(), 72);
        assert_eq!(out.non_finite_count(), 0);
        assert!(out.contains("O3_forecast_smoothed"));
        assert!(out.contains("wind_speed_lag_48"));
        assert!(out.contains("temp_seasonal_anomaly"));

        let report = e.quality_report().unwrap();
        assert_eq!(report.original_shape, (72, 10));
        assert!(report.features_added > 100);
        assert!(report.missing_values_pct > 0.0);
    }

    #[test]
    fn test_targets_and_calendar_are_not_scaled() {
        let mut e = enhancer();
        let input = raw(48, 0.0);
        let out = e.fit_transform(input.clone()).unwrap();
        assert_eq!(out.column("hour").unwrap(), input.column("hour").unwrap());
        assert_eq!(out.column("NO2_target").unwrap(), input.column("NO2_target").unwrap());
    }

    #[test]
    fn test_empty_input_rejected() {
        let mut e = enhancer();
        assert!(matches!(e.fit_transform(Frame::new()), Err(QualityError::EmptyInput)));
    }

    // ==================== Replay ====================

    #[test]
    fn test_transform_before_fit_fails() {
        let e = enhancer();
        assert!(matches!(e.transform_new_data(raw(10, 0.0)), Err(QualityError::NotFitted)));
    }

    #[test]
    fn test_replay_matches_fit_output() {
        let mut e = enhancer();
        let fitted = e.fit_transform(raw(72, 0.0)).unwrap();
        let replayed = e.transform_new_data(raw(72, 0.0)).unwrap();
        assert!(fitted.same_values(&replayed));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut e = enhancer();
        e.fit_transform(raw(72, 0.0)).unwrap();
        let a = e.transform_new_data(raw(60, 5.0)).unwrap();
        let b = e.transform_new_data(raw(60, 5.0)).unwrap();
        assert!(a.same_values(&b));
        assert_eq!(a.non_finite_count(), 0);
    }

    #[test]
    fn test_replay_on_short_input_keeps_smoothed_columns() {
        let mut e = enhancer();
        let fitted = e.fit_transform(raw(72, 0.0)).unwrap();
        let out = e.transform_new_data(raw(4, 0.0)).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out.column_names(), fitted.column_names());
        assert!(out.contains("O3_forecast_smoothed"));
        assert_eq!(out.non_finite_count(), 0);
    }

    #[test]
    fn test_missing_fitted_column_is_mismatch() {
        let mut e = enhancer();
        e.fit_transform(raw(48, 0.0)).unwrap();
        let mut new = raw(48, 0.0);
        new.remove("q_forecast");
        let err = e.transform_new_data(new).unwrap_err();
        let QualityError::FeatureMismatch { missing } = err else {
            panic!("expected mismatch");
        };
        assert!(missing.iter().any(|m| m == "q_forecast"));
    }

    #[test]
    fn test_missing_target_is_imputed() {
        let mut e = enhancer();
        e.fit_transform(raw(48, 0.0)).unwrap();
        let mut new = raw(24, 0.0);
        new.remove("NO2_target");
        let out = e.transform_new_data(new).unwrap();
        assert_eq!(out.non_finite_count(), 0);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut e = enhancer();
        e.fit_transform(raw(48, 0.0)).unwrap();
        let json = serde_json::to_string(e.state().unwrap()).unwrap();
        let state: QualityState = serde_json::from_str(&json).unwrap();
        let restored = DataQualityEnhancer::from_state(state);
        let a = e.transform_new_data(raw(30, 1.0)).unwrap();
        let b = restored.transform_new_data(raw(30, 1.0)).unwrap();
        assert!(a.same_values(&b));
    }

    // ==================== Segments ====================

    #[test]
    fn test_segments_keep_their_own_history() {
        let mut e = enhancer();
        let out = e
            .fit_transform_segments(vec![raw(30, 0.0), raw(30, 100.0)])
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 30);
        assert_eq!(out[0].column_names(), out[1].column_names());
        // Lags at the start of the second segment are imputed, never taken
        // from the end of the first one.
        let median = e
            .state()
            .unwrap()
            .medians
            .iter()
            .find(|(n, _)| n == "O3_forecast_lag_1")
            .map(|(_, m)| *m)
            .unwrap();
        let lag = e.state().unwrap().scaler.columns.iter().find(|c| c.name == "O3_forecast_lag_1").unwrap();
        assert_eq!(out[1].column("O3_forecast_lag_1").unwrap()[0], lag.params.apply(median));
    }
}
