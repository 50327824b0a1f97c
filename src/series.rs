//! Column kernels over polars chunked arrays.
//!
//! Frames hold missing cells as `NaN`. The kernels hand polars a null-masked copy
//! so its null-aware aggregations, shifts and rolling windows skip them, then map
//! nulls back to `NaN`. Every column kernel returns a column of the input length
//! so row alignment with the time axis is never lost.

use polars::prelude::*;

/// `NaN` cells become nulls.
pub(crate) fn to_chunked(values: &[f64]) -> Float64Chunked {
    values.iter().map(|&v| (!v.is_nan()).then_some(v)).collect()
}

/// Nulls become `NaN`.
pub(crate) fn to_values(ca: &Float64Chunked) -> Vec<f64> {
    ca.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect()
}

/// Values of `values` that are not NaN.
pub fn present(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| !v.is_nan()).collect()
}

// ==================== Aggregations ====================

/// Arithmetic mean of the present values, NaN when there are none.
pub fn mean(values: &[f64]) -> f64 {
    to_chunked(values).mean().unwrap_or(f64::NAN)
}

/// Standard deviation of the present values with `ddof` degrees of freedom removed.
pub fn std_dev(values: &[f64], ddof: u8) -> f64 {
    let ca = to_chunked(values);
    if ca.len() - ca.null_count() <= usize::from(ddof) {
        return f64::NAN;
    }
    ca.std(ddof).unwrap_or(f64::NAN)
}

fn quantile_of(ca: &Float64Chunked, q: f64) -> Option<f64> {
    ca.quantile(q.clamp(0.0, 1.0), QuantileInterpolOptions::Linear)
        .ok()
        .flatten()
}

fn mad_of(ca: &Float64Chunked) -> Option<f64> {
    let m = ca.median()?;
    let deviations: Float64Chunked = ca.into_iter().map(|v| v.map(|x| (x - m).abs())).collect();
    deviations.median()
}

/// Quantile of the present values, linearly interpolated between closest ranks.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    quantile_of(&to_chunked(values), q).unwrap_or(f64::NAN)
}

/// Several quantiles of the present values, sorting once.
pub fn quantiles(values: &[f64], qs: &[f64]) -> Vec<f64> {
    let sorted = Float64Chunked::from_vec("", present(values)).sort(false);
    qs.iter()
        .map(|&q| quantile_of(&sorted, q).unwrap_or(f64::NAN))
        .collect()
}

pub fn median(values: &[f64]) -> f64 {
    to_chunked(values).median().unwrap_or(f64::NAN)
}

/// Median absolute deviation around the median.
pub fn mad(values: &[f64]) -> f64 {
    mad_of(&to_chunked(values)).unwrap_or(f64::NAN)
}

pub fn min(values: &[f64]) -> f64 {
    to_chunked(values).min().unwrap_or(f64::NAN)
}

pub fn max(values: &[f64]) -> f64 {
    to_chunked(values).max().unwrap_or(f64::NAN)
}

// ==================== Shifts ====================

/// Value `periods` rows earlier; the first `periods` rows become NaN.
pub fn shift(values: &[f64], periods: usize) -> Vec<f64> {
    to_values(&to_chunked(values).shift(periods as i64))
}

/// Difference to the value `periods` rows earlier.
pub fn diff(values: &[f64], periods: usize) -> Vec<f64> {
    let ca = to_chunked(values);
    to_values(&(&ca - &ca.shift(periods as i64)))
}

/// Fractional change relative to the value `periods` rows earlier.
///
/// A zero base yields ±inf; callers rely on the terminal imputation pass.
pub fn pct_change(values: &[f64], periods: usize) -> Vec<f64> {
    let ca = to_chunked(values);
    let ratio = &ca / &ca.shift(periods as i64);
    to_values(&(&ratio - 1.0))
}

/// Propagate the last present value forward.
pub fn forward_fill(values: &[f64]) -> Vec<f64> {
    fill(values, FillNullStrategy::Forward(None))
}

/// Propagate the next present value backward.
pub fn backward_fill(values: &[f64]) -> Vec<f64> {
    fill(values, FillNullStrategy::Backward(None))
}

fn fill(values: &[f64], strategy: FillNullStrategy) -> Vec<f64> {
    let filled = to_chunked(values)
        .into_series()
        .fill_null(strategy)
        .and_then(|s| s.f64().map(to_values));
    match filled {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(error = %e, "Fill failed, column left unchanged");
            values.to_vec()
        }
    }
}

// ==================== Rolling Windows ====================

/// Trailing fixed window; a row needs `min_periods` present values in its window.
fn rolling<F>(values: &[f64], window: usize, min_periods: usize, op: F) -> Vec<f64>
where
    F: FnOnce(&Series, RollingOptionsFixedWindow) -> PolarsResult<Series>,
{
    let window = window.max(1);
    let options = RollingOptionsFixedWindow {
        window_size: window,
        min_periods: min_periods.clamp(1, window),
        ..Default::default()
    };
    let series = to_chunked(values).into_series();
    match op(&series, options).and_then(|s| s.f64().map(to_values)) {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(error = %e, window, "Rolling statistic failed, column left missing");
            vec![f64::NAN; values.len()]
        }
    }
}

pub fn rolling_mean(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    rolling(values, window, min_periods, |s, o| s.rolling_mean(o))
}

/// Rolling sample standard deviation (ddof 1).
pub fn rolling_std(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    rolling(values, window, min_periods, |s, o| s.rolling_std(o))
}

pub fn rolling_min(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    rolling(values, window, min_periods, |s, o| s.rolling_min(o))
}

pub fn rolling_max(values: &[f64], window: usize, min_periods: usize) -> Vec<f64> {
    rolling(values, window, min_periods, |s, o| s.rolling_max(o))
}

/// Statistic over zero-copy slices of the trailing window ending at each row.
/// Rows whose window holds no present value are NaN.
fn rolling_slices<F>(values: &[f64], window: usize, stat: F) -> Vec<f64>
where
    F: Fn(&Float64Chunked) -> Option<f64>,
{
    let ca = to_chunked(values);
    let window = window.max(1);
    (0..ca.len())
        .map(|end| {
            let start = (end + 1).saturating_sub(window);
            stat(&ca.slice(start as i64, end + 1 - start)).unwrap_or(f64::NAN)
        })
        .collect()
}

pub fn rolling_quantile(values: &[f64], window: usize, q: f64) -> Vec<f64> {
    rolling_slices(values, window, |w| quantile_of(w, q))
}

pub fn rolling_mad(values: &[f64], window: usize) -> Vec<f64> {
    rolling_slices(values, window, mad_of)
}

// ==================== Binning ====================

/// Bin label for right-closed intervals `(edges[i], edges[i + 1]]`.
///
/// Values outside every interval (including the lowest edge itself) are NaN.
pub fn cut(value: f64, edges: &[f64]) -> f64 {
    if value.is_nan() {
        return f64::NAN;
    }
    edges
        .windows(2)
        .position(|w| value > w[0] && value <= w[1])
        .map_or(f64::NAN, |i| i as f64)
}
