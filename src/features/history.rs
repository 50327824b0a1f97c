//! Lagged and rolling views of observed target history.

use crate::frame::Frame;
use crate::series;

pub const TARGET_LAGS: [usize; 7] = [1, 2, 3, 6, 12, 24, 48];
pub const TARGET_WINDOWS: [usize; 5] = [3, 6, 12, 24, 48];

/// Add `{t}_lag_{k}` and `{t}_rolling_{stat}_{w}` for every present target.
///
/// Rolling statistics require a full window; standard deviation is the sample one.
pub fn add_target_history(mut frame: Frame, targets: &[String]) -> Frame {
    for target in targets {
        let Some(values) = frame.column(target).map(<[f64]>::to_vec) else {
            continue;
        };
        for lag in TARGET_LAGS {
            frame.set(format!("{target}_lag_{lag}"), series::shift(&values, lag));
        }
        for window in TARGET_WINDOWS {
            frame.set(
                format!("{target}_rolling_mean_{window}"),
                series::rolling_mean(&values, window, window),
            );
            frame.set(
                format!("{target}_rolling_std_{window}"),
                series::rolling_std(&values, window, window),
            );
            frame.set(
                format!("{target}_rolling_min_{window}"),
                series::rolling_min(&values, window, window),
            );
            frame.set(
                format!("{target}_rolling_max_{window}"),
                series::rolling_max(&values, window, window),
            );
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lags_and_rolling_windows() {
        let values: Vec<f64> = (0..60).map(f64::from).collect();
        let frame = Frame::from_columns([("NO2_target", values)]).unwrap();
        let out = add_target_history(frame, &["NO2_target".to_string()]);

        let lag = out.column("NO2_target_lag_3").unwrap();
        assert!(lag[2].is_nan());
        assert_eq!(lag[10], 7.0);

        let mean = out.column("NO2_target_rolling_mean_3").unwrap();
        assert!(mean[1].is_nan());
        assert_eq!(mean[2], 1.0);

        let max = out.column("NO2_target_rolling_max_48").unwrap();
        assert!(max[46].is_nan());
        assert_eq!(max[47], 47.0);

        let std = out.column("NO2_target_rolling_std_3").unwrap();
        assert!((std[5] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_absent_target_is_skipped() {
        let frame = Frame::from_columns([("x", vec![1.0])]).unwrap();
        let out = add_target_history(frame, &["O3_target".to_string()]);
        assert_eq!(out.width(), 1);
    }
}
