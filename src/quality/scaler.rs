//! Column scalers fitted once on training data.

use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameError};
use crate::series;

const MAX_QUANTILES: usize = 1000;
const QUANTILE_CLIP: f64 = 1e-7;
const LAMBDA_RANGE: (f64, f64) = (-3.0, 3.0);
const GOLDEN_TOL: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMethod {
    /// Median / IQR
    #[default]
    Robust,
    /// Empirical CDF mapped to a standard normal
    Quantile,
    /// Yeo-Johnson followed by standardization
    Power,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ColumnParams {
    Robust { center: f64, scale: f64 },
    Quantile { quantiles: Vec<f64> },
    Power { lambda: f64, mean: f64, std: f64 },
}

impl ColumnParams {
    fn fit(method: ScalingMethod, values: &[f64]) -> Self {
        match method {
            ScalingMethod::Robust => {
                let center = series::median(values);
                let iqr = series::quantile(values, 0.75) - series::quantile(values, 0.25);
                let scale = if iqr > 0.0 && iqr.is_finite() { iqr } else { 1.0 };
                ColumnParams::Robust {
                    center: if center.is_nan() { 0.0 } else { center },
                    scale,
                }
            }
            ScalingMethod::Quantile => {
                let data = series::present(values);
                let n = data.len().min(MAX_QUANTILES);
                let quantiles = if n < 2 {
                    vec![data.first().copied().unwrap_or(0.0); 2]
                } else {
                    let grid: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
                    series::quantiles(&data, &grid)
                };
                ColumnParams::Quantile { quantiles }
            }
            ScalingMethod::Power => {
                let data = series::present(values);
                let lambda = yeo_johnson_lambda(&data);
                let transformed: Vec<f64> = data.iter().map(|&x| yeo_johnson(x, lambda)).collect();
                let mean = series::mean(&transformed);
                let std = series::std_dev(&transformed, 0);
                ColumnParams::Power {
                    lambda,
                    mean: if mean.is_nan() { 0.0 } else { mean },
                    std: if std > 0.0 && std.is_finite() { std } else { 1.0 },
                }
            }
        }
    }

    pub fn apply(&self, x: f64) -> f64 {
        match self {
            ColumnParams::Robust { center, scale } => (x - center) / scale,
            ColumnParams::Quantile { quantiles } => {
                let p = empirical_cdf(x, quantiles).clamp(QUANTILE_CLIP, 1.0 - QUANTILE_CLIP);
                normal_ppf(p)
            }
            ColumnParams::Power { lambda, mean, std } => (yeo_johnson(x, *lambda) - mean) / std,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaledColumn {
    pub name: String,
    pub params: ColumnParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedScaler {
    pub method: ScalingMethod,
    pub columns: Vec<ScaledColumn>,
}

impl FittedScaler {
    /// Fit one scaler per column of `frame` not listed in `exclude`.
    pub fn fit(frame: &Frame, method: ScalingMethod, exclude: &[String]) -> Self {
        let columns = frame
            .names()
            .filter(|n| !exclude.iter().any(|e| e.as_str() == *n))
            .filter_map(|n| {
                frame.column(n).map(|values| ScaledColumn {
                    name: n.to_string(),
                    params: ColumnParams::fit(method, values),
                })
            })
            .collect::<Vec<_>>();
        tracing::info!(?method, columns = columns.len(), "Fitted scaler");
        Self { method, columns }
    }

    pub fn transform(&self, frame: &mut Frame) -> Result<(), FrameError> {
        for column in &self.columns {
            frame.map_column(&column.name, |x| column.params.apply(x))?;
        }
        Ok(())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Forward/backward averaged linear interpolation onto [0, 1], robust to
/// repeated quantile values.
fn empirical_cdf(x: f64, quantiles: &[f64]) -> f64 {
    let n = quantiles.len();
    let refs: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();
    let forward = interp(x, quantiles, &refs);
    let neg_q: Vec<f64> = quantiles.iter().rev().map(|q| -q).collect();
    let neg_r: Vec<f64> = refs.iter().rev().map(|r| -r).collect();
    let backward = -interp(-x, &neg_q, &neg_r);
    0.5 * (forward + backward)
}

/// `numpy.interp` semantics for ascending `xp`.
fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let last = xp.len() - 1;
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }
    let j = xp.partition_point(|&v| v <= x) - 1;
    let slope = (fp[j + 1] - fp[j]) / (xp[j + 1] - xp[j]);
    fp[j] + slope * (x - xp[j])
}

/// Inverse standard normal CDF (Acklam's rational approximation).
pub fn normal_ppf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -normal_ppf(1.0 - p)
    }
}

pub fn yeo_johnson(x: f64, lambda: f64) -> f64 {
    const EPS: f64 = 1e-12;
    if x >= 0.0 {
        if lambda.abs() < EPS {
            x.ln_1p()
        } else {
            ((x + 1.0).powf(lambda) - 1.0) / lambda
        }
    } else if (lambda - 2.0).abs() < EPS {
        -(-x).ln_1p()
    } else {
        -((1.0 - x).powf(2.0 - lambda) - 1.0) / (2.0 - lambda)
    }
}

fn yeo_johnson_log_likelihood(data: &[f64], lambda: f64) -> f64 {
    let n = data.len() as f64;
    let transformed: Vec<f64> = data.iter().map(|&x| yeo_johnson(x, lambda)).collect();
    let var = series::std_dev(&transformed, 0).powi(2);
    let jacobian: f64 = data.iter().map(|x| x.signum() * x.abs().ln_1p()).sum();
    let ll = -n / 2.0 * var.ln() + (lambda - 1.0) * jacobian;
    if ll.is_nan() { f64::NEG_INFINITY } else { ll }
}

/// Maximum-likelihood lambda by golden-section search.
fn yeo_johnson_lambda(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 1.0;
    }
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = LAMBDA_RANGE;
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let mut fc = yeo_johnson_log_likelihood(data, c);
    let mut fd = yeo_johnson_log_likelihood(data, d);
    while (b - a).abs() > GOLDEN_TOL {
        if fc > fd {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = yeo_johnson_log_likelihood(data, c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = yeo_johnson_log_likelihood(data, d);
        }
    }
    (a + b) / 2.0
}
