//! Satellite column transforms and pollutant forecast derivatives.

use crate::frame::Frame;
use crate::series;

const SATELLITE_EPS: f64 = 1e-8;
const POLLUTANT_EPS: f64 = 1e-6;

const NO2_AQI_EDGES: [f64; 6] = [0.0, 40.0, 80.0, 180.0, 280.0, f64::INFINITY];
const O3_AQI_EDGES: [f64; 6] = [0.0, 50.0, 100.0, 168.0, 208.0, f64::INFINITY];

/// Column maxima of the pollutant forecasts learned on the training data.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PollutionMaxima {
    pub no2_forecast: f64,
    pub o3_forecast: f64,
}

impl PollutionMaxima {
    /// Maxima of the forecast columns, `None` unless both are present.
    pub fn fit(frame: &Frame) -> Option<Self> {
        let no2_forecast = series::max(frame.column("NO2_forecast")?);
        let o3_forecast = series::max(frame.column("O3_forecast")?);
        if no2_forecast.is_nan() || o3_forecast.is_nan() {
            return None;
        }
        Some(Self {
            no2_forecast,
            o3_forecast,
        })
    }
}

pub fn add_satellite_features(mut frame: Frame) -> Frame {
    for name in ["NO2_satellite", "HCHO_satellite"] {
        if let Some(x) = frame.column(name).map(<[f64]>::to_vec) {
            frame.set(
                format!("{name}_log"),
                x.iter().map(|v| (v + SATELLITE_EPS).ln()).collect(),
            );
            frame.set(
                format!("{name}_sqrt"),
                x.iter().map(|v| v.max(0.0).sqrt()).collect(),
            );
        }
    }

    if let Some(r) = frame.column("ratio_satellite").map(<[f64]>::to_vec) {
        frame.set(
            "ratio_satellite_log",
            r.iter().map(|v| (v + SATELLITE_EPS).ln()).collect(),
        );
        frame.set(
            "ratio_satellite_inv",
            r.iter().map(|v| 1.0 / (v + SATELLITE_EPS)).collect(),
        );
    }

    if let (Some(no2), Some(hcho)) = (frame.column("NO2_satellite"), frame.column("HCHO_satellite")) {
        let pairs: Vec<(f64, f64)> = no2.iter().copied().zip(hcho.iter().copied()).collect();
        frame.set("NO2_HCHO_product", pairs.iter().map(|(a, b)| a * b).collect());
        frame.set("NO2_HCHO_diff", pairs.iter().map(|(a, b)| a - b).collect());
        frame.set(
            "NO2_HCHO_ratio_alt",
            pairs.iter().map(|(a, b)| a / (b + SATELLITE_EPS)).collect(),
        );
    }

    tracing::debug!("Created satellite features");
    frame
}

/// Pollutant ratios, AQI categories and the combined index.
///
/// `maxima` comes from training data; without it the index is not produced.
pub fn add_pollution_features(mut frame: Frame, maxima: Option<PollutionMaxima>) -> Frame {
    let no2 = frame.column("NO2_forecast").map(<[f64]>::to_vec);
    let o3 = frame.column("O3_forecast").map(<[f64]>::to_vec);

    if let (Some(no2), Some(o3)) = (&no2, &o3) {
        frame.set(
            "NO2_O3_forecast_ratio",
            no2.iter().zip(o3).map(|(n, o)| n / (o + POLLUTANT_EPS)).collect(),
        );
        frame.set(
            "O3_NO2_forecast_ratio",
            o3.iter().zip(no2).map(|(o, n)| o / (n + POLLUTANT_EPS)).collect(),
        );
    }
    if let Some(no2) = &no2 {
        frame.set(
            "NO2_forecast_aqi_category",
            no2.iter().map(|&v| series::cut(v, &NO2_AQI_EDGES)).collect(),
        );
    }
    if let Some(o3) = &o3 {
        frame.set(
            "O3_forecast_aqi_category",
            o3.iter().map(|&v| series::cut(v, &O3_AQI_EDGES)).collect(),
        );
    }
    if let (Some(sat), Some(no2)) = (frame.column("NO2_satellite").map(<[f64]>::to_vec), &no2) {
        frame.set(
            "NO2_satellite_forecast_ratio",
            sat.iter().zip(no2).map(|(s, n)| s / (n + POLLUTANT_EPS)).collect(),
        );
        frame.set(
            "NO2_satellite_forecast_diff",
            sat.iter().zip(no2).map(|(s, n)| s - n).collect(),
        );
    }
    if let (Some(no2), Some(o3), Some(max)) = (&no2, &o3, maxima) {
        let index = no2
            .iter()
            .zip(o3)
            .map(|(n, o)| {
                let n = n / (max.no2_forecast + POLLUTANT_EPS);
                let o = o / (max.o3_forecast + POLLUTANT_EPS);
                (n + o) / 2.0
            })
            .collect();
        frame.set("combined_pollution_index", index);
    }

    tracing::debug!("Created pollution features");
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satellite_zero_denominators_are_finite() {
        let frame = Frame::from_columns([
            ("NO2_satellite", vec![0.0, 2.0]),
            ("HCHO_satellite", vec![0.0, 1.0]),
            ("ratio_satellite", vec![0.0, 2.0]),
        ])
        .unwrap();
        let out = add_satellite_features(frame);
        for name in [
            "NO2_satellite_log",
            "HCHO_satellite_log",
            "ratio_satellite_log",
            "ratio_satellite_inv",
            "NO2_HCHO_ratio_alt",
        ] {
            assert!(out.column(name).unwrap().iter().all(|v| v.is_finite()), "{name}");
        }
        assert_eq!(out.column("NO2_HCHO_product").unwrap()[1], 2.0);
    }

    #[test]
    fn test_negative_satellite_sqrt_clamped() {
        let frame = Frame::from_columns([("NO2_satellite", vec![-4.0])]).unwrap();
        let out = add_satellite_features(frame);
        assert_eq!(out.column("NO2_satellite_sqrt").unwrap(), &[0.0]);
    }

    #[test]
    fn test_pollution_ratios_and_categories() {
        let frame = Frame::from_columns([
            ("NO2_forecast", vec![0.0, 100.0]),
            ("O3_forecast", vec![0.0, 60.0]),
        ])
        .unwrap();
        let maxima = PollutionMaxima::fit(&frame);
        let out = add_pollution_features(frame, maxima);

        assert!(out.column("NO2_O3_forecast_ratio").unwrap().iter().all(|v| v.is_finite()));
        assert_eq!(out.column("NO2_forecast_aqi_category").unwrap()[1], 2.0);
        assert_eq!(out.column("O3_forecast_aqi_category").unwrap()[1], 1.0);
        let index = out.column("combined_pollution_index").unwrap();
        assert!(index[0].abs() < 1e-12);
        assert!((index[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_combined_index_uses_supplied_maxima() {
        let frame = Frame::from_columns([
            ("NO2_forecast", vec![50.0]),
            ("O3_forecast", vec![50.0]),
        ])
        .unwrap();
        let maxima = PollutionMaxima {
            no2_forecast: 100.0,
            o3_forecast: 100.0,
        };
        let out = add_pollution_features(frame.clone(), Some(maxima));
        assert!((out.column("combined_pollution_index").unwrap()[0] - 0.5).abs() < 1e-6);

        let without = add_pollution_features(frame, None);
        assert!(!without.contains("combined_pollution_index"));
    }
}
