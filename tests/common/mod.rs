//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use aq_forecast::config::{AppConfig, SiteConfig};
use aq_forecast::frame::Frame;

/// Hourly site data with daily cycles in meteorology and both pollutants.
pub fn synthetic_site(rows: usize, phase: f64) -> Frame {
    let t: Vec<f64> = (0..rows).map(|i| i as f64).collect();
    let wave = |scale: f64, offset: f64| -> Vec<f64> {
        t.iter()
            .map(|i| offset + scale * ((i / 24.0) * std::f64::consts::TAU + phase).sin())
            .collect()
    };
    Frame::from_columns([
        ("year", vec![2024.0; rows]),
        ("month", vec![3.0; rows]),
        ("day", t.iter().map(|i| 1.0 + (i / 24.0).floor()).collect()),
        ("hour", t.iter().map(|i| i % 24.0).collect()),
        ("T_forecast", wave(6.0, 295.0)),
        ("q_forecast", wave(1.0, 8.0)),
        ("u_forecast", wave(1.5, 1.0)),
        ("v_forecast", wave(1.0, -0.5)),
        ("w_forecast", wave(0.1, 0.0)),
        ("O3_forecast", wave(12.0, 40.0)),
        ("NO2_forecast", wave(-8.0, 38.0)),
        ("O3_target", wave(15.0, 45.0)),
        ("NO2_target", wave(-10.0, 35.0)),
    ])
    .expect("synthetic frame")
}

/// A configuration small enough to train in a unit test.
pub fn small_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.training.sequence_length = 6;
    config.training.forecast_horizon = 3;
    config.training.epochs = 2;
    config.training.batch_size = 16;
    config.training.augment = false;
    config.training.search_epochs = 1;
    config.training.mc_samples = 5;
    config.model.lstm_units = 8;
    config.model.num_layers = 1;
    config.model.attention_heads = 2;
    config.model.cnn_filters = 4;
    config.tracking.enabled = false;
    config.paths.model_dir = root.join("models");
    config.paths.plots_dir = root.join("plots");
    config
}

/// Write a site's history CSV and return its service entry.
pub fn write_site(root: &Path, name: &str, latitude: f64, longitude: f64, frame: &Frame) -> SiteConfig {
    let history_path: PathBuf = root.join(format!("{name}.csv"));
    frame.write_csv(&history_path).expect("write site csv");
    SiteConfig {
        name: name.to_string(),
        latitude,
        longitude,
        history_path,
    }
}
