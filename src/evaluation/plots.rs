//! Diagnostic PNG plots for a set of forecasts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::Array3;
use plotters::prelude::*;

use super::target_columns;
use crate::series;

const PANEL_WIDTH: u32 = 600;
const PANEL_HEIGHT: u32 = 450;
const TIME_SERIES_POINTS: usize = 200;
const LEVEL_LABELS: [&str; 5] = ["Low", "Moderate", "High", "Very High", "Extreme"];
const LEVEL_PERCENTILES: [f64; 6] = [0.0, 0.25, 0.50, 0.75, 0.90, 1.0];

/// Write scatter, time-series, residual and error-by-level plots to
/// `dir/{prefix}_{kind}.png`.
///
/// Plotting is best effort: any failure is logged and no paths are returned.
pub fn create_evaluation_plots(
    y_true: &Array3<f32>,
    y_pred: &Array3<f32>,
    target_names: &[String],
    dir: &Path,
    prefix: &str,
) -> Vec<PathBuf> {
    match write_all(y_true, y_pred, target_names, dir, prefix) {
        Ok(paths) => {
            tracing::info!(count = paths.len(), dir = %dir.display(), "Saved evaluation plots");
            paths
        }
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "Failed to create evaluation plots");
            Vec::new()
        }
    }
}

struct Series {
    name: String,
    truth: Vec<f64>,
    pred: Vec<f64>,
}

fn write_all(
    y_true: &Array3<f32>,
    y_pred: &Array3<f32>,
    target_names: &[String],
    dir: &Path,
    prefix: &str,
) -> Result<Vec<PathBuf>> {
    if y_true.shape() != y_pred.shape() || y_true.is_empty() {
        anyhow::bail!("cannot plot shapes {:?} and {:?}", y_true.shape(), y_pred.shape());
    }
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let series: Vec<Series> = target_columns(y_true)
        .into_iter()
        .zip(target_columns(y_pred))
        .enumerate()
        .map(|(i, (truth, pred))| Series {
            name: target_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("Target {}", i + 1)),
            truth,
            pred,
        })
        .collect();

    let path = |kind: &str| dir.join(format!("{prefix}_{kind}.png"));
    let scatter_path = path("scatter");
    let time_series_path = path("time_series");
    let residuals_path = path("residuals");
    let levels_path = path("error_by_level");

    plot_scatter(&scatter_path, &series).context("scatter plot")?;
    plot_time_series(&time_series_path, &series).context("time-series plot")?;
    plot_residuals(&residuals_path, &series).context("residual plot")?;
    plot_error_by_level(&levels_path, &series).context("error-by-level plot")?;

    Ok(vec![scatter_path, time_series_path, residuals_path, levels_path])
}

/// Padded `[lo, hi)` range covering every finite value.
fn bounds<'a>(values: impl Iterator<Item = &'a f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return (0.0, 1.0);
    }
    let pad = ((hi - lo) * 0.05).max(0.5);
    (lo - pad, hi + pad)
}

fn plot_scatter(path: &Path, series: &[Series]) -> Result<()> {
    let root =
        BitMapBackend::new(path, (PANEL_WIDTH * series.len() as u32, PANEL_HEIGHT)).into_drawing_area();
    root.fill(&WHITE)?;

    for (panel, s) in root.split_evenly((1, series.len())).iter().zip(series) {
        let (lo, hi) = bounds(s.truth.iter().chain(&s.pred));
        let mut chart = ChartBuilder::on(panel)
            .caption(format!("{} - Predicted vs Actual", s.name), ("sans-serif", 20))
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(lo..hi, lo..hi)?;
        chart.configure_mesh().x_desc("Actual").y_desc("Predicted").draw()?;
        chart.draw_series(
            s.truth
                .iter()
                .zip(&s.pred)
                .map(|(&t, &p)| Circle::new((t, p), 2, BLUE.mix(0.5).filled())),
        )?;
        chart.draw_series(LineSeries::new(vec![(lo, lo), (hi, hi)], RED.stroke_width(2)))?;
    }
    root.present()?;
    Ok(())
}

fn plot_time_series(path: &Path, series: &[Series]) -> Result<()> {
    let root =
        BitMapBackend::new(path, (PANEL_WIDTH * 2, PANEL_HEIGHT * series.len() as u32)).into_drawing_area();
    root.fill(&WHITE)?;

    for (panel, s) in root.split_evenly((series.len(), 1)).iter().zip(series) {
        let n = s.truth.len().min(TIME_SERIES_POINTS);
        let (lo, hi) = bounds(s.truth[..n].iter().chain(&s.pred[..n]));
        let mut chart = ChartBuilder::on(panel)
            .caption(format!("{} - Time Series Comparison", s.name), ("sans-serif", 20))
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(0usize..n.max(1), lo..hi)?;
        chart.configure_mesh().x_desc("Time Step").y_desc("Concentration").draw()?;

        let actual = BLUE;
        chart
            .draw_series(LineSeries::new(
                s.truth[..n].iter().enumerate().map(|(i, &v)| (i, v)),
                actual.stroke_width(2),
            ))?
            .label("Actual")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], actual.filled()));
        let predicted = RED;
        chart
            .draw_series(LineSeries::new(
                s.pred[..n].iter().enumerate().map(|(i, &v)| (i, v)),
                predicted.stroke_width(2),
            ))?
            .label("Predicted")
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], predicted.filled()));
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()?;
    }
    root.present()?;
    Ok(())
}

fn plot_residuals(path: &Path, series: &[Series]) -> Result<()> {
    let root = BitMapBackend::new(path, (PANEL_WIDTH * series.len() as u32, PANEL_HEIGHT * 2))
        .into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((2, series.len()));

    for (i, s) in series.iter().enumerate() {
        let residuals: Vec<f64> = s.truth.iter().zip(&s.pred).map(|(t, p)| t - p).collect();

        let (px, py) = (bounds(s.pred.iter()), bounds(residuals.iter()));
        let mut chart = ChartBuilder::on(&panels[i])
            .caption(format!("{} - Residuals vs Predicted", s.name), ("sans-serif", 20))
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(px.0..px.1, py.0..py.1)?;
        chart.configure_mesh().x_desc("Predicted").y_desc("Residual").draw()?;
        chart.draw_series(
            s.pred
                .iter()
                .zip(&residuals)
                .map(|(&p, &r)| Circle::new((p, r), 2, BLUE.mix(0.5).filled())),
        )?;
        chart.draw_series(LineSeries::new(vec![(px.0, 0.0), (px.1, 0.0)], RED.stroke_width(1)))?;

        let bins = histogram(&residuals, 30);
        let top = bins.iter().map(|b| b.2).fold(0.0, f64::max).max(1.0);
        let mut hist = ChartBuilder::on(&panels[series.len() + i])
            .caption(format!("{} - Residual Distribution", s.name), ("sans-serif", 20))
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(py.0..py.1, 0.0..top * 1.1)?;
        hist.configure_mesh().x_desc("Residual").y_desc("Frequency").draw()?;
        hist.draw_series(
            bins.iter()
                .map(|&(a, b, count)| Rectangle::new([(a, 0.0), (b, count)], BLUE.mix(0.6).filled())),
        )?;
    }
    root.present()?;
    Ok(())
}

fn plot_error_by_level(path: &Path, series: &[Series]) -> Result<()> {
    let root =
        BitMapBackend::new(path, (PANEL_WIDTH * series.len() as u32, PANEL_HEIGHT)).into_drawing_area();
    root.fill(&WHITE)?;

    for (panel, s) in root.split_evenly((1, series.len())).iter().zip(series) {
        let errors = errors_by_level(&s.truth, &s.pred);
        let top = errors.iter().copied().fold(0.0, f64::max).max(1.0);
        let mut chart = ChartBuilder::on(panel)
            .caption(format!("{} - Error by Pollution Level", s.name), ("sans-serif", 20))
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(0.0..LEVEL_LABELS.len() as f64, 0.0..top * 1.1)?;
        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(LEVEL_LABELS.len())
            .x_label_formatter(&|x| {
                LEVEL_LABELS
                    .get(x.floor() as usize)
                    .map_or(String::new(), |l| l.to_string())
            })
            .x_desc("Pollution Level")
            .y_desc("Mean Absolute Error")
            .draw()?;
        chart.draw_series(errors.iter().enumerate().map(|(i, &e)| {
            let x = i as f64;
            Rectangle::new([(x + 0.15, 0.0), (x + 0.85, e)], GREEN.mix(0.7).filled())
        }))?;
    }
    root.present()?;
    Ok(())
}

/// `(start, end, count)` for `n` equal-width bins.
fn histogram(values: &[f64], n: usize) -> Vec<(f64, f64, f64)> {
    let (lo, hi) = bounds(values.iter());
    let width = (hi - lo) / n as f64;
    let mut counts = vec![0.0; n];
    for v in values.iter().filter(|v| v.is_finite()) {
        let idx = (((v - lo) / width) as usize).min(n - 1);
        counts[idx] += 1.0;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, c)| (lo + i as f64 * width, lo + (i + 1) as f64 * width, c))
        .collect()
}

/// Mean absolute error within each percentile band of the truth; the top
/// band includes the maximum.
fn errors_by_level(truth: &[f64], pred: &[f64]) -> Vec<f64> {
    let edges: Vec<f64> = LEVEL_PERCENTILES
        .iter()
        .map(|&q| series::quantile(truth, q))
        .collect();
    (0..LEVEL_LABELS.len())
        .map(|j| {
            let last = j == LEVEL_LABELS.len() - 1;
            let errors: Vec<f64> = truth
                .iter()
                .zip(pred)
                .filter(|&(&t, _)| t >= edges[j] && (t < edges[j + 1] || (last && t <= edges[j + 1])))
                .map(|(t, p)| (t - p).abs())
                .collect();
            if errors.is_empty() { 0.0 } else { series::mean(&errors) }
        })
        .collect()
}
