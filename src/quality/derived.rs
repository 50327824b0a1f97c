//! Rolling robust statistics, interaction terms and lag/difference features.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::series;

/// Variables that receive robust statistics and lag/difference features.
pub const KEY_VARIABLES: [&str; 5] = [
    "O3_forecast",
    "NO2_forecast",
    "T_forecast",
    "q_forecast",
    "wind_speed",
];

const ROBUST_WINDOWS: [usize; 4] = [3, 6, 12, 24];
const KEY_LAGS: [usize; 7] = [1, 2, 3, 6, 12, 24, 48];
const DIFF_PERIODS: [usize; 4] = [1, 3, 6, 12];
const CROSS_LAGS: [usize; 3] = [1, 3, 6];
const RATIO_EPS: f64 = 1e-6;

pub fn add_robust_features(mut frame: Frame) -> Frame {
    for var in KEY_VARIABLES {
        let Some(values) = frame.column(var).map(<[f64]>::to_vec) else {
            continue;
        };
        for w in ROBUST_WINDOWS {
            let q25 = series::rolling_quantile(&values, w, 0.25);
            let q75 = series::rolling_quantile(&values, w, 0.75);
            frame.set(format!("{var}_median_{w}h"), series::rolling_quantile(&values, w, 0.5));
            frame.set(
                format!("{var}_iqr_{w}h"),
                q75.iter().zip(&q25).map(|(a, b)| a - b).collect(),
            );
            frame.set(format!("{var}_mad_{w}h"), series::rolling_mad(&values, w));
            frame.set(format!("{var}_p10_{w}h"), series::rolling_quantile(&values, w, 0.1));
            frame.set(format!("{var}_p90_{w}h"), series::rolling_quantile(&values, w, 0.9));
        }
    }

    if let (Some(o3), Some(no2)) = (
        frame.column("O3_forecast").map(<[f64]>::to_vec),
        frame.column("NO2_forecast").map(<[f64]>::to_vec),
    ) {
        for w in [12, 24] {
            let o3_med = series::rolling_quantile(&o3, w, 0.5);
            let no2_med = series::rolling_quantile(&no2, w, 0.5);
            frame.set(
                format!("O3_NO2_ratio_median_{w}h"),
                o3_med.iter().zip(&no2_med).map(|(o, n)| o / (n + RATIO_EPS)).collect(),
            );
        }
    }
    tracing::debug!("Created robust statistical features");
    frame
}

/// Monthly `T_forecast` means learned at fit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyMeans {
    pub by_month: BTreeMap<u32, f64>,
    pub overall: f64,
}

impl MonthlyMeans {
    pub fn fit(frame: &Frame) -> Option<Self> {
        let month = frame.column("month")?;
        let t = frame.column("T_forecast")?;
        let mut sums: BTreeMap<u32, (f64, usize)> = BTreeMap::new();
        for (&m, &v) in month.iter().zip(t) {
            if m.is_nan() || v.is_nan() {
                continue;
            }
            let entry = sums.entry(m as u32).or_insert((0.0, 0));
            entry.0 += v;
            entry.1 += 1;
        }
        let by_month = sums
            .into_iter()
            .map(|(m, (sum, count))| (m, sum / count as f64))
            .collect();
        let overall = series::mean(t);
        if overall.is_nan() {
            return None;
        }
        Some(Self { by_month, overall })
    }

    fn lookup(&self, month: f64) -> f64 {
        if month.is_nan() {
            return self.overall;
        }
        self.by_month
            .get(&(month as u32))
            .copied()
            .unwrap_or(self.overall)
    }
}

pub fn add_interaction_features(mut frame: Frame, monthly: Option<&MonthlyMeans>) -> Frame {
    let get = |f: &Frame, name: &str| f.column(name).map(<[f64]>::to_vec);
    let t = get(&frame, "T_forecast");
    let q = get(&frame, "q_forecast");
    let speed = get(&frame, "wind_speed");
    let no2_sat = get(&frame, "NO2_satellite");
    let solar = get(&frame, "solar_radiation_proxy");
    let hour = get(&frame, "hour");

    let zip = |a: &[f64], b: &[f64], f: &dyn Fn(f64, f64) -> f64| -> Vec<f64> {
        a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
    };

    if let (Some(t), Some(q)) = (&t, &q) {
        frame.set("temp_humidity_interaction", zip(t, q, &|t, q| t * q));
        frame.set("temp_humidity_ratio", zip(t, q, &|t, q| t / (q + 1e-8)));
    }
    if let (Some(t), Some(s)) = (&t, &speed) {
        frame.set("wind_temp_interaction", zip(s, t, &|s, t| s * t));
        frame.set("thermal_wind_ratio", zip(t, s, &|t, s| t / (s + 0.1)));
    }
    if let (Some(n), Some(s)) = (&no2_sat, &speed) {
        frame.set("NO2_dispersion_potential", zip(n, s, &|n, s| n / (s + 0.1)));
    }
    if let (Some(sol), Some(t), Some(n)) = (&solar, &t, &no2_sat) {
        let potential = (0..frame.len()).map(|i| sol[i] * t[i] * n[i]).collect();
        frame.set("photochemical_reaction_potential", potential);
    }
    if let Some(hour) = &hour {
        let in_range = |h: f64, lo: f64, hi: f64| {
            if h.is_nan() {
                f64::NAN
            } else if (lo..=hi).contains(&h) {
                1.0
            } else {
                0.0
            }
        };
        let morning: Vec<f64> = hour.iter().map(|&h| in_range(h, 7.0, 10.0)).collect();
        let evening: Vec<f64> = hour.iter().map(|&h| in_range(h, 17.0, 20.0)).collect();
        frame.set("rush_hour", zip(&morning, &evening, &|a, b| a + b));
        frame.set("morning_rush", morning);
        frame.set("evening_rush", evening);
        if let Some(weekend) = get(&frame, "is_weekend") {
            frame.set("weekend_hour_interaction", zip(&weekend, hour, &|w, h| w * h));
        }
    }
    if let (Some(t), Some(month), Some(monthly)) = (&t, get(&frame, "month"), monthly) {
        frame.set(
            "temp_seasonal_anomaly",
            zip(t, &month, &|t, m| t - monthly.lookup(m)),
        );
    }
    tracing::debug!("Created interaction features");
    frame
}

pub fn add_lag_difference_features(mut frame: Frame) -> Frame {
    for var in KEY_VARIABLES {
        let Some(values) = frame.column(var).map(<[f64]>::to_vec) else {
            continue;
        };
        for lag in KEY_LAGS {
            frame.set(format!("{var}_lag_{lag}"), series::shift(&values, lag));
        }
        for k in DIFF_PERIODS {
            frame.set(format!("{var}_diff_{k}"), series::diff(&values, k));
            frame.set(format!("{var}_pct_change_{k}"), series::pct_change(&values, k));
        }
        frame.set(
            format!("{var}_acceleration"),
            series::diff(&series::diff(&values, 1), 1),
        );
    }

    if let (Some(o3), Some(no2)) = (
        frame.column("O3_forecast").map(<[f64]>::to_vec),
        frame.column("NO2_forecast").map(<[f64]>::to_vec),
    ) {
        for k in CROSS_LAGS {
            let no2_lag = series::shift(&no2, k);
            let o3_lag = series::shift(&o3, k);
            frame.set(
                format!("O3_NO2_lag_ratio_{k}"),
                o3.iter().zip(&no2_lag).map(|(o, n)| o / (n + RATIO_EPS)).collect(),
            );
            frame.set(
                format!("NO2_O3_lag_ratio_{k}"),
                no2.iter().zip(&o3_lag).map(|(n, o)| n / (o + RATIO_EPS)).collect(),
            );
        }
    }
    tracing::debug!("Created lag and difference features");
    frame
}
