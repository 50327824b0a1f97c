//! Savitzky-Golay smoothing.
//!
//! Interior points use the least-squares convolution weights; the first and
//! last half-window are evaluated from a polynomial fitted to the first/last
//! full window.

use thiserror::Error;

use crate::frame::Frame;
use crate::series;

/// Columns that receive a `{col}_smoothed` companion.
pub const SMOOTHED_COLUMNS: [&str; 4] = ["O3_forecast", "NO2_forecast", "T_forecast", "q_forecast"];

#[derive(Debug, Error, PartialEq)]
pub enum SmoothingError {
    #[error("window length {0} must be odd")]
    EvenWindow(usize),
    #[error("window length {window} must exceed polyorder {polyorder}")]
    WindowTooSmall { window: usize, polyorder: usize },
    #[error("window length {window} exceeds the {samples} available samples")]
    WindowTooLarge { window: usize, samples: usize },
    #[error("least-squares system is singular")]
    Singular,
}

/// Add `{col}_smoothed` for each present smoothing column.
///
/// The companion column always exists so fitted and replayed frames share a
/// schema. It is all NaN, left for imputation, when the column has no more than
/// `window` present values or the filter parameters are invalid.
pub fn smooth_time_series(mut frame: Frame, window: usize, polyorder: usize) -> Frame {
    for name in SMOOTHED_COLUMNS {
        let Some(values) = frame.column(name) else {
            continue;
        };
        let smoothed = if series::present(values).len() <= window {
            tracing::debug!(column = name, window, "Too few values to smooth");
            None
        } else {
            let filled = series::backward_fill(&series::forward_fill(values));
            match savgol_filter(&filled, window, polyorder) {
                Ok(smoothed) => Some(smoothed),
                Err(e) => {
                    tracing::warn!(column = name, error = %e, "Could not smooth column");
                    None
                }
            }
        };
        let rows = frame.len();
        frame.set(
            format!("{name}_smoothed"),
            smoothed.unwrap_or_else(|| vec![f64::NAN; rows]),
        );
    }
    frame
}

pub fn savgol_filter(values: &[f64], window: usize, polyorder: usize) -> Result<Vec<f64>, SmoothingError> {
    if window % 2 == 0 {
        return Err(SmoothingError::EvenWindow(window));
    }
    if window <= polyorder {
        return Err(SmoothingError::WindowTooSmall { window, polyorder });
    }
    if window > values.len() {
        return Err(SmoothingError::WindowTooLarge {
            window,
            samples: values.len(),
        });
    }

    let half = window / 2;
    let xs: Vec<f64> = (0..window).map(|i| i as f64 - half as f64).collect();
    let weights = center_weights(&xs, polyorder)?;

    let n = values.len();
    let mut out = vec![0.0; n];
    for i in half..n - half {
        out[i] = weights
            .iter()
            .zip(&values[i - half..=i + half])
            .map(|(w, v)| w * v)
            .sum();
    }

    let head = fit_polynomial(&xs, &values[..window], polyorder)?;
    for (i, slot) in out.iter_mut().enumerate().take(half) {
        *slot = eval_polynomial(&head, xs[i]);
    }
    let tail = fit_polynomial(&xs, &values[n - window..], polyorder)?;
    for i in 0..half {
        out[n - half + i] = eval_polynomial(&tail, xs[half + 1 + i]);
    }
    Ok(out)
}

/// Weights that evaluate the least-squares polynomial at x = 0.
fn center_weights(xs: &[f64], order: usize) -> Result<Vec<f64>, SmoothingError> {
    let gram = gram_matrix(xs, order);
    let mut e0 = vec![0.0; order + 1];
    e0[0] = 1.0;
    let c = solve(gram, e0).ok_or(SmoothingError::Singular)?;
    Ok(xs
        .iter()
        .map(|&x| c.iter().enumerate().map(|(j, cj)| cj * x.powi(j as i32)).sum())
        .collect())
}

fn gram_matrix(xs: &[f64], order: usize) -> Vec<Vec<f64>> {
    (0..=order)
        .map(|r| {
            (0..=order)
                .map(|c| xs.iter().map(|x| x.powi((r + c) as i32)).sum())
                .collect()
        })
        .collect()
}

fn fit_polynomial(xs: &[f64], ys: &[f64], order: usize) -> Result<Vec<f64>, SmoothingError> {
    let rhs = (0..=order)
        .map(|r| xs.iter().zip(ys).map(|(x, y)| y * x.powi(r as i32)).sum())
        .collect();
    solve(gram_matrix(xs, order), rhs).ok_or(SmoothingError::Singular)
}

fn eval_polynomial(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let s: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - s) / a[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_weights() {
        // Classic 5-point quadratic weights: (-3, 12, 17, 12, -3) / 35
        let xs = [-2.0, -1.0, 0.0, 1.0, 2.0];
        let w = center_weights(&xs, 2).unwrap();
        let expected = [-3.0, 12.0, 17.0, 12.0, -3.0].map(|v| v / 35.0);
        for (a, b) in w.iter().zip(expected) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_polynomial_passes_through_unchanged() {
        let values: Vec<f64> = (0..12).map(|i| 0.5 * (i * i) as f64 - 2.0 * i as f64 + 1.0).collect();
        let smoothed = savgol_filter(&values, 5, 2).unwrap();
        for (a, b) in smoothed.iter().zip(&values) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_invalid_parameters() {
        let values = vec![1.0; 10];
        assert_eq!(savgol_filter(&values, 4, 2), Err(SmoothingError::EvenWindow(4)));
        assert!(matches!(
            savgol_filter(&values, 3, 3),
            Err(SmoothingError::WindowTooSmall { .. })
        ));
        assert!(matches!(
            savgol_filter(&values, 11, 2),
            Err(SmoothingError::WindowTooLarge { .. })
        ));
    }

    #[test]
    fn test_short_column_gets_all_nan_companion() {
        let short = Frame::from_columns([("O3_forecast", vec![1.0, 2.0, 3.0, 4.0, 5.0])]).unwrap();
        let out = smooth_time_series(short, 5, 2);
        let smoothed = out.column("O3_forecast_smoothed").unwrap();
        assert_eq!(smoothed.len(), 5);
        assert!(smoothed.iter().all(|v| v.is_nan()));

        let gappy =
            Frame::from_columns([("NO2_forecast", vec![1.0, f64::NAN, 3.0, 2.0, 5.0, 4.0, 6.0])]).unwrap();
        let out = smooth_time_series(gappy, 5, 2);
        assert!(out.column("NO2_forecast_smoothed").unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_even_window_leaves_companion_all_nan() {
        let frame = Frame::from_columns([("T_forecast", (0..10).map(f64::from).collect())]).unwrap();
        let out = smooth_time_series(frame, 4, 2);
        assert!(out.column("T_forecast_smoothed").unwrap().iter().all(|v| v.is_nan()));
        assert!(!out.contains("q_forecast_smoothed"));
    }
}
