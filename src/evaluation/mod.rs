//! Forecast evaluation metrics.
//!
//! All functions are pure over `(y_true, y_pred)` pairs of identical shape.
//! Sequence outputs `(n, H, T)` are flattened to `(n * H, T)` first.
//! Percentage-style accuracies are reported on a 0-100 scale.

pub mod plots;

use std::cmp::Ordering;
use std::fmt;

use ndarray::{Array3, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sequence::flatten_horizon;

pub use plots::create_evaluation_plots;

#[derive(Debug, Error, PartialEq)]
pub enum EvaluationError {
    #[error("shape mismatch: y_true {truth:?} vs y_pred {pred:?}")]
    ShapeMismatch { truth: Vec<usize>, pred: Vec<usize> },
    #[error("no samples to evaluate")]
    Empty,
    #[error("unknown comparison metric: {0}")]
    UnknownMetric(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMetrics {
    pub name: String,
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
    pub r2: f64,
    pub bias: f64,
    pub correlation: f64,
    pub correlation_pvalue: f64,
    pub accuracy_within_10_percent: f64,
    pub accuracy_within_20_percent: f64,
    pub accuracy_within_10_units: f64,
    pub overall_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
    pub r2: f64,
    pub bias: f64,
    pub normalized_rmse: f64,
    pub index_of_agreement: f64,
    pub nash_sutcliffe: f64,
    pub accuracy_within_10_percent: f64,
    pub accuracy_within_20_percent: f64,
    pub accuracy_within_30_percent: f64,
    pub accuracy_within_5_units: f64,
    pub accuracy_within_10_units: f64,
    pub accuracy_within_15_units: f64,
    pub overall_accuracy_score: f64,
    pub targets: Vec<TargetMetrics>,
}

impl MetricsReport {
    /// Look up a metric by its comparison name.
    pub fn metric(&self, name: &str) -> Option<f64> {
        let value = match name.to_lowercase().as_str() {
            "rmse" => self.rmse,
            "mae" => self.mae,
            "mape" => self.mape,
            "r2" => self.r2,
            "bias" => self.bias,
            "normalized_rmse" => self.normalized_rmse,
            "index_of_agreement" => self.index_of_agreement,
            "nash_sutcliffe" => self.nash_sutcliffe,
            "overall_accuracy_score" => self.overall_accuracy_score,
            "correlation" => {
                if self.targets.is_empty() {
                    return None;
                }
                self.targets.iter().map(|t| t.correlation).sum::<f64>() / self.targets.len() as f64
            }
            _ => return None,
        };
        Some(value)
    }

    pub fn target(&self, name: &str) -> Option<&TargetMetrics> {
        self.targets.iter().find(|t| t.name == name)
    }
}

/// Evaluate sequence forecasts of shape `(n, H, T)`.
pub fn calculate_sequence_metrics(
    y_true: &Array3<f32>,
    y_pred: &Array3<f32>,
    target_names: &[String],
) -> Result<MetricsReport, EvaluationError> {
    if y_true.shape() != y_pred.shape() {
        return Err(EvaluationError::ShapeMismatch {
            truth: y_true.shape().to_vec(),
            pred: y_pred.shape().to_vec(),
        });
    }
    let truth = flatten_horizon(y_true);
    let pred = flatten_horizon(y_pred);
    calculate_metrics(truth.view(), pred.view(), target_names)
}

/// Evaluate `(samples, targets)` arrays.
///
/// Targets beyond `target_names` are named `target_{i}`.
pub fn calculate_metrics(
    y_true: ArrayView2<f32>,
    y_pred: ArrayView2<f32>,
    target_names: &[String],
) -> Result<MetricsReport, EvaluationError> {
    if y_true.shape() != y_pred.shape() {
        return Err(EvaluationError::ShapeMismatch {
            truth: y_true.shape().to_vec(),
            pred: y_pred.shape().to_vec(),
        });
    }
    if y_true.is_empty() {
        return Err(EvaluationError::Empty);
    }

    let truth: Vec<f64> = y_true.iter().map(|&v| f64::from(v)).collect();
    let pred: Vec<f64> = y_pred.iter().map(|&v| f64::from(v)).collect();

    let targets: Vec<TargetMetrics> = (0..y_true.ncols())
        .map(|i| {
            let name = target_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("target_{i}"));
            target_metrics(name, y_true.column(i), y_pred.column(i))
        })
        .collect();

    let rmse = mse(&truth, &pred).sqrt();
    let range = max(&truth) - min(&truth);
    let r2 = targets.iter().map(|t| t.r2).sum::<f64>() / targets.len() as f64;

    let report = MetricsReport {
        rmse,
        mae: mae(&truth, &pred),
        mape: mape(&truth, &pred),
        r2,
        bias: bias(&truth, &pred),
        normalized_rmse: if range > 0.0 { rmse / range } else { rmse },
        index_of_agreement: index_of_agreement(&truth, &pred),
        nash_sutcliffe: nash_sutcliffe(&truth, &pred),
        accuracy_within_10_percent: accuracy_within_percent(&truth, &pred, 0.10),
        accuracy_within_20_percent: accuracy_within_percent(&truth, &pred, 0.20),
        accuracy_within_30_percent: accuracy_within_percent(&truth, &pred, 0.30),
        accuracy_within_5_units: accuracy_within_units(&truth, &pred, 5.0),
        accuracy_within_10_units: accuracy_within_units(&truth, &pred, 10.0),
        accuracy_within_15_units: accuracy_within_units(&truth, &pred, 15.0),
        overall_accuracy_score: combine_accuracy(
            accuracy_within_percent(&truth, &pred, 0.10),
            accuracy_within_percent(&truth, &pred, 0.20),
            accuracy_within_units(&truth, &pred, 10.0),
            r2,
        ),
        targets,
    };

    tracing::info!(
        rmse = report.rmse,
        mae = report.mae,
        r2 = report.r2,
        overall = report.overall_accuracy_score,
        "Calculated metrics"
    );
    Ok(report)
}

fn target_metrics(name: String, truth: ArrayView1<f32>, pred: ArrayView1<f32>) -> TargetMetrics {
    let truth: Vec<f64> = truth.iter().map(|&v| f64::from(v)).collect();
    let pred: Vec<f64> = pred.iter().map(|&v| f64::from(v)).collect();
    let (correlation, correlation_pvalue) = pearson(&truth, &pred);
    TargetMetrics {
        name,
        rmse: mse(&truth, &pred).sqrt(),
        mae: mae(&truth, &pred),
        mape: mape(&truth, &pred),
        r2: r2_score(&truth, &pred),
        bias: bias(&truth, &pred),
        correlation,
        correlation_pvalue,
        accuracy_within_10_percent: accuracy_within_percent(&truth, &pred, 0.10),
        accuracy_within_20_percent: accuracy_within_percent(&truth, &pred, 0.20),
        accuracy_within_10_units: accuracy_within_units(&truth, &pred, 10.0),
        overall_accuracy: overall_accuracy_score(&truth, &pred),
    }
}

// ==================== Scalar Metrics ====================

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 { f64::NAN } else { sum / n as f64 }
}

fn min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

pub fn mse(truth: &[f64], pred: &[f64]) -> f64 {
    mean(truth.iter().zip(pred).map(|(t, p)| (t - p).powi(2)))
}

pub fn mae(truth: &[f64], pred: &[f64]) -> f64 {
    mean(truth.iter().zip(pred).map(|(t, p)| (t - p).abs()))
}

/// Mean prediction minus truth.
pub fn bias(truth: &[f64], pred: &[f64]) -> f64 {
    mean(truth.iter().zip(pred).map(|(t, p)| p - t))
}

/// Mean absolute percentage error over non-zero truths; `+inf` when all are zero.
pub fn mape(truth: &[f64], pred: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for (t, p) in truth.iter().zip(pred) {
        if *t != 0.0 {
            sum += ((t - p) / t).abs();
            n += 1;
        }
    }
    if n == 0 { f64::INFINITY } else { sum / n as f64 * 100.0 }
}

/// Coefficient of determination. Constant truth scores 1 when matched
/// exactly and 0 otherwise.
pub fn r2_score(truth: &[f64], pred: &[f64]) -> f64 {
    let m = mean(truth.iter().copied());
    let ss_res: f64 = truth.iter().zip(pred).map(|(t, p)| (t - p).powi(2)).sum();
    let ss_tot: f64 = truth.iter().map(|t| (t - m).powi(2)).sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Willmott's index of agreement; 1 when the denominator vanishes.
pub fn index_of_agreement(truth: &[f64], pred: &[f64]) -> f64 {
    let m = mean(truth.iter().copied());
    let numerator: f64 = truth.iter().zip(pred).map(|(t, p)| (t - p).powi(2)).sum();
    let denominator: f64 = truth
        .iter()
        .zip(pred)
        .map(|(t, p)| ((p - m).abs() + (t - m).abs()).powi(2))
        .sum();
    if denominator == 0.0 { 1.0 } else { 1.0 - numerator / denominator }
}

/// Nash-Sutcliffe efficiency; 1 when the truth has no variance.
pub fn nash_sutcliffe(truth: &[f64], pred: &[f64]) -> f64 {
    let m = mean(truth.iter().copied());
    let numerator: f64 = truth.iter().zip(pred).map(|(t, p)| (t - p).powi(2)).sum();
    let denominator: f64 = truth.iter().map(|t| (t - m).powi(2)).sum();
    if denominator == 0.0 { 1.0 } else { 1.0 - numerator / denominator }
}

/// Percentage of non-zero truths predicted within a relative `threshold`.
pub fn accuracy_within_percent(truth: &[f64], pred: &[f64], threshold: f64) -> f64 {
    let mut hits = 0usize;
    let mut n = 0usize;
    for (t, p) in truth.iter().zip(pred) {
        if *t != 0.0 {
            n += 1;
            if ((t - p) / t).abs() <= threshold {
                hits += 1;
            }
        }
    }
    if n == 0 { 0.0 } else { hits as f64 / n as f64 * 100.0 }
}

/// Percentage of predictions within an absolute `threshold`.
pub fn accuracy_within_units(truth: &[f64], pred: &[f64], threshold: f64) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let hits = truth
        .iter()
        .zip(pred)
        .filter(|(t, p)| (*t - *p).abs() <= threshold)
        .count();
    hits as f64 / truth.len() as f64 * 100.0
}

/// `0.3 acc10% + 0.2 acc20% + 0.3 acc10units + 0.2 clamp(r2 * 100, 0, 100)`.
pub fn overall_accuracy_score(truth: &[f64], pred: &[f64]) -> f64 {
    combine_accuracy(
        accuracy_within_percent(truth, pred, 0.10),
        accuracy_within_percent(truth, pred, 0.20),
        accuracy_within_units(truth, pred, 10.0),
        r2_score(truth, pred),
    )
}

fn combine_accuracy(acc10: f64, acc20: f64, acc10_units: f64, r2: f64) -> f64 {
    0.3 * acc10 + 0.2 * acc20 + 0.3 * acc10_units + 0.2 * (r2 * 100.0).clamp(0.0, 100.0)
}

// ==================== Correlation ====================

/// Pearson correlation and its two-sided p-value.
///
/// Zero variance in either series gives `(0.0, 1.0)`; fewer than three
/// samples give a p-value of 1.
pub fn pearson(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len().min(y.len());
    if n < 2 {
        return (0.0, 1.0);
    }
    let mx = mean(x.iter().copied());
    let my = mean(y.iter().copied());
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx == 0.0 || syy == 0.0 {
        return (0.0, 1.0);
    }
    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);
    if n < 3 {
        return (r, 1.0);
    }
    let df = (n - 2) as f64;
    if (1.0 - r * r) <= 0.0 {
        return (r, 0.0);
    }
    let t2 = r * r * df / (1.0 - r * r);
    let p = regularized_incomplete_beta(df / (df + t2), df / 2.0, 0.5);
    (r, p.clamp(0.0, 1.0))
}

/// Lanczos approximation of `ln(Gamma(x))` for `x > 0`.
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    let mut y = x;
    for c in COEFFS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// `I_x(a, b)` via the continued fraction expansion.
pub fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 3e-14;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

// ==================== Summaries ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccuracyGrade {
    A,
    B,
    C,
    D,
    F,
}

impl AccuracyGrade {
    pub fn label(self) -> &'static str {
        match self {
            AccuracyGrade::A => "Excellent (A)",
            AccuracyGrade::B => "Good (B)",
            AccuracyGrade::C => "Fair (C)",
            AccuracyGrade::D => "Poor (D)",
            AccuracyGrade::F => "Very Poor (F)",
        }
    }
}

impl fmt::Display for AccuracyGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn accuracy_grade(score: f64) -> AccuracyGrade {
    match score {
        s if s >= 80.0 => AccuracyGrade::A,
        s if s >= 70.0 => AccuracyGrade::B,
        s if s >= 60.0 => AccuracyGrade::C,
        s if s >= 50.0 => AccuracyGrade::D,
        _ => AccuracyGrade::F,
    }
}

/// One row of the metrics summary table, rounded to four decimals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub name: String,
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
    pub r2: f64,
    pub bias: f64,
    pub index_of_agreement: Option<f64>,
    pub nash_sutcliffe: Option<f64>,
    pub correlation: Option<f64>,
}

fn round4(v: f64) -> f64 {
    (v * 1e4).round() / 1e4
}

/// Overall row followed by one row per target.
pub fn metrics_summary(report: &MetricsReport) -> Vec<SummaryRow> {
    let mut rows = vec![SummaryRow {
        name: "Overall".to_string(),
        rmse: round4(report.rmse),
        mae: round4(report.mae),
        mape: round4(report.mape),
        r2: round4(report.r2),
        bias: round4(report.bias),
        index_of_agreement: Some(round4(report.index_of_agreement)),
        nash_sutcliffe: Some(round4(report.nash_sutcliffe)),
        correlation: None,
    }];
    rows.extend(report.targets.iter().map(|t| SummaryRow {
        name: t.name.clone(),
        rmse: round4(t.rmse),
        mae: round4(t.mae),
        mape: round4(t.mape),
        r2: round4(t.r2),
        bias: round4(t.bias),
        index_of_agreement: None,
        nash_sutcliffe: None,
        correlation: Some(round4(t.correlation)),
    }));
    rows
}

/// Multi-line accuracy summary with grade and per-target scores.
pub fn accuracy_summary(report: &MetricsReport) -> String {
    let mut out = String::new();
    let score = report.overall_accuracy_score;
    out.push_str(&format!("Overall Accuracy Score: {score:.1}/100\n"));
    out.push_str(&format!("Accuracy Grade: {}\n", accuracy_grade(score)));
    out.push_str(&format!(
        "Within ±10%: {:.1}%  ±20%: {:.1}%  ±30%: {:.1}%\n",
        report.accuracy_within_10_percent,
        report.accuracy_within_20_percent,
        report.accuracy_within_30_percent
    ));
    out.push_str(&format!(
        "Within ±5: {:.1}%  ±10: {:.1}%  ±15: {:.1}% (µg/m³)\n",
        report.accuracy_within_5_units,
        report.accuracy_within_10_units,
        report.accuracy_within_15_units
    ));
    for t in &report.targets {
        out.push_str(&format!(
            "{}: {:.1}/100 ({})\n",
            t.name,
            t.overall_accuracy,
            accuracy_grade(t.overall_accuracy)
        ));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub model: String,
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
    pub r2: f64,
    pub bias: f64,
    /// `(target, rmse, r2)`
    pub per_target: Vec<(String, f64, f64)>,
}

/// Rank models by `metric`: ascending for errors, descending for
/// r2, correlation, index_of_agreement and nash_sutcliffe.
pub fn compare_models(
    results: &[(String, MetricsReport)],
    metric: &str,
) -> Result<Vec<ComparisonRow>, EvaluationError> {
    let descending = matches!(
        metric.to_lowercase().as_str(),
        "r2" | "correlation" | "index_of_agreement" | "nash_sutcliffe"
    );
    let mut keyed = results
        .iter()
        .map(|(name, report)| {
            report
                .metric(metric)
                .map(|key| (key, name, report))
                .ok_or_else(|| EvaluationError::UnknownMetric(metric.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    keyed.sort_by(|a, b| {
        if descending { nan_last(-a.0, -b.0) } else { nan_last(a.0, b.0) }
    });

    Ok(keyed
        .into_iter()
        .map(|(_, name, report)| ComparisonRow {
            model: name.clone(),
            rmse: round4(report.rmse),
            mae: round4(report.mae),
            mape: round4(report.mape),
            r2: round4(report.r2),
            bias: round4(report.bias),
            per_target: report
                .targets
                .iter()
                .map(|t| (t.name.clone(), round4(t.rmse), round4(t.r2)))
                .collect(),
        })
        .collect())
}

/// Ascending order with NaN ranked last.
pub(crate) fn nan_last(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => a.total_cmp(&b),
    }
}

/// Flatten `(n, H, T)` into one column per target.
pub fn target_columns(y: &Array3<f32>) -> Vec<Vec<f64>> {
    let flat = flatten_horizon(y);
    flat.axis_iter(Axis(1))
        .map(|col| col.iter().map(|&v| f64::from(v)).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn names() -> Vec<String> {
        vec!["O3_target".to_string(), "NO2_target".to_string()]
    }

    fn column(values: &[f32]) -> Array2<f32> {
        Array2::from_shape_vec((values.len(), 1), values.to_vec()).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // ==================== Scenarios ====================

    #[test]
    fn test_perfect_predictions_score_100() {
        let y = column(&[50.0, 52.0, 48.0]);
        let report = calculate_metrics(y.view(), y.view(), &names()[..1]).unwrap();
        assert_eq!(report.rmse, 0.0);
        assert_eq!(report.mae, 0.0);
        assert!(approx(report.r2, 1.0));
        assert!(approx(report.accuracy_within_10_percent, 100.0));
        assert!(approx(report.overall_accuracy_score, 100.0));
        assert_eq!(accuracy_grade(report.overall_accuracy_score), AccuracyGrade::A);
    }

    #[test]
    fn test_mape_excludes_zero_truth() {
        let truth = [0.0, 10.0, 20.0];
        let pred = [5.0, 11.0, 18.0];
        // (0.1 + 0.1) / 2 * 100
        assert!(approx(mape(&truth, &pred), 10.0));
        assert_eq!(mape(&[0.0, 0.0], &[1.0, 2.0]), f64::INFINITY);
    }

    #[test]
    fn test_overall_weights_exact() {
        // acc10% = 50, acc20% = 100, acc10units = 50, r2 = 0 for constant truth
        let truth = [100.0, 100.0];
        let pred = [105.0, 115.0];
        assert_eq!(r2_score(&truth, &pred), 0.0);
        assert!(approx(overall_accuracy_score(&truth, &pred), 0.3 * 50.0 + 0.2 * 100.0 + 0.3 * 50.0));
    }

    // ==================== Edge Cases ====================

    #[test]
    fn test_constant_truth() {
        let truth = [5.0, 5.0, 5.0];
        assert_eq!(r2_score(&truth, &truth), 1.0);
        assert_eq!(r2_score(&truth, &[5.0, 6.0, 5.0]), 0.0);
        assert_eq!(nash_sutcliffe(&truth, &[4.0, 4.0, 4.0]), 1.0);
        assert_eq!(pearson(&truth, &[1.0, 2.0, 3.0]), (0.0, 1.0));
    }

    #[test]
    fn test_accuracy_all_zero_truth() {
        assert_eq!(accuracy_within_percent(&[0.0, 0.0], &[0.0, 1.0], 0.1), 0.0);
    }

    #[test]
    fn test_index_of_agreement_perfect() {
        let v = [1.0, 2.0, 3.0];
        assert!(approx(index_of_agreement(&v, &v), 1.0));
        assert_eq!(index_of_agreement(&[2.0, 2.0], &[2.0, 2.0]), 1.0);
    }

    #[test]
    fn test_normalized_rmse_zero_range() {
        let truth = column(&[3.0, 3.0]);
        let pred = column(&[4.0, 4.0]);
        let report = calculate_metrics(truth.view(), pred.view(), &[]).unwrap();
        assert!(approx(report.normalized_rmse, 1.0));
        assert_eq!(report.targets[0].name, "target_0");
    }

    #[test]
    fn test_shape_mismatch() {
        let a = column(&[1.0, 2.0]);
        let b = column(&[1.0]);
        assert!(matches!(
            calculate_metrics(a.view(), b.view(), &[]),
            Err(EvaluationError::ShapeMismatch { .. })
        ));
    }

    // ==================== Correlation ====================

    #[test]
    fn test_pearson_pvalue() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let (r, p) = pearson(&x, &[2.0, 4.0, 6.0, 8.0, 10.0]);
        assert!(approx(r, 1.0));
        assert_eq!(p, 0.0);

        // r = 0.8 with n = 5 has p ~= 0.1041
        let (r, p) = pearson(&x, &[1.0, 3.0, 2.0, 5.0, 4.0]);
        assert!(approx(r, 0.8));
        assert!((p - 0.1041).abs() < 1e-3, "p = {p}");
    }

    #[test]
    fn test_incomplete_beta_symmetry() {
        // I_{0.5}(a, a) = 0.5
        assert!((regularized_incomplete_beta(0.5, 2.5, 2.5) - 0.5).abs() < 1e-10);
        assert_eq!(regularized_incomplete_beta(0.0, 1.0, 1.0), 0.0);
        assert!((regularized_incomplete_beta(0.3, 1.0, 1.0) - 0.3).abs() < 1e-10);
    }

    // ==================== Sequences and Summaries ====================

    #[test]
    fn test_sequence_metrics_flatten_horizon() {
        let y = Array3::from_shape_fn((3, 2, 2), |(i, h, t)| (10 + i + h + t * 5) as f32);
        let report = calculate_sequence_metrics(&y, &y, &names()).unwrap();
        assert_eq!(report.targets.len(), 2);
        assert_eq!(report.targets[1].name, "NO2_target");
        assert!(approx(report.overall_accuracy_score, 100.0));
    }

    #[test]
    fn test_metrics_summary_rows() {
        let y = Array3::from_shape_fn((3, 1, 2), |(i, _, t)| (20 + i + t) as f32);
        let report = calculate_sequence_metrics(&y, &y, &names()).unwrap();
        let rows = metrics_summary(&report);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].name, "Overall");
        assert!(rows[0].correlation.is_none());
        assert!(rows[1].correlation.is_some());
        assert!(accuracy_summary(&report).contains("Excellent (A)"));
    }

    #[test]
    fn test_compare_models_ordering() {
        let truth = column(&[10.0, 20.0, 30.0]);
        let good = column(&[10.0, 21.0, 30.0]);
        let bad = column(&[15.0, 10.0, 40.0]);
        let results = vec![
            ("bad".to_string(), calculate_metrics(truth.view(), bad.view(), &[]).unwrap()),
            ("good".to_string(), calculate_metrics(truth.view(), good.view(), &[]).unwrap()),
        ];

        let by_rmse = compare_models(&results, "rmse").unwrap();
        assert_eq!(by_rmse[0].model, "good");
        let by_r2 = compare_models(&results, "r2").unwrap();
        assert_eq!(by_r2[0].model, "good");
        assert!(matches!(
            compare_models(&results, "nonsense"),
            Err(EvaluationError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(accuracy_grade(80.0), AccuracyGrade::A);
        assert_eq!(accuracy_grade(79.9), AccuracyGrade::B);
        assert_eq!(accuracy_grade(60.0), AccuracyGrade::C);
        assert_eq!(accuracy_grade(50.0), AccuracyGrade::D);
        assert_eq!(accuracy_grade(49.9), AccuracyGrade::F);
    }
}
