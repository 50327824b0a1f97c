use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::features::TemperatureUnit;
use crate::ml::ModelParams;
use crate::quality::{OutlierMethod, QualityOptions, ScalingMethod};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub data: DataConfig,
    pub split: SplitConfig,
    pub features: FeatureSettings,
    pub quality: QualityOptions,
    pub model: ModelParams,
    pub training: TrainingConfig,
    pub tracking: TrackingConfig,
    pub network: NetworkConfig,
    pub paths: PathsConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    /// CSV file or directory of per-site CSV files
    pub path: PathBuf,
    pub targets: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/processed"),
            targets: vec!["O3_target".to_string(), "NO2_target".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SplitConfig {
    pub train_ratio: f64,
    pub val_ratio: f64,
    pub test_ratio: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_ratio: 0.7,
            val_ratio: 0.15,
            test_ratio: 0.15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeatureSettings {
    pub temperature_unit: TemperatureUnit,
    /// Latitude used by the solar elevation proxy
    pub reference_latitude: f64,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            temperature_unit: TemperatureUnit::Auto,
            reference_latitude: 28.6,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainingConfig {
    pub sequence_length: usize,
    pub forecast_horizon: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub patience: usize,
    pub augment: bool,
    pub augment_factor: f64,
    pub mc_samples: usize,
    pub seed: u64,
    pub search_epochs: usize,
    pub search_trials: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            sequence_length: 72,
            forecast_horizon: 48,
            epochs: 200,
            batch_size: 64,
            patience: 25,
            augment: true,
            augment_factor: 0.1,
            mc_samples: 100,
            seed: 42,
            search_epochs: 50,
            search_trials: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    pub enabled: bool,
    /// MLflow tracking server base URI
    pub uri: String,
    pub experiment_name: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            uri: "http://localhost:5000".to_string(),
            experiment_name: "air_quality_forecasting".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub model_dir: PathBuf,
    pub plots_dir: PathBuf,
    /// Where the best epoch is checkpointed during the main training stage
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            plots_dir: PathBuf::from("plots"),
            checkpoint_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Saved model bundle directory
    pub model_path: Option<PathBuf>,
    /// Serve labelled heuristic predictions when the learned model is unavailable
    pub heuristic_fallback: bool,
    pub region: RegionConfig,
    pub sites: Vec<SiteConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            heuristic_fallback: false,
            region: RegionConfig::default(),
            sites: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RegionConfig {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            lat_min: 28.4,
            lat_max: 28.9,
            lon_min: 76.8,
            lon_max: 77.5,
        }
    }
}

/// A monitoring site whose recent observations feed the learned predictor.
#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub history_path: PathBuf,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file (silently ignore if not present)
        let _ = dotenvy::dotenv();

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aq-forecast");

        let builder = Config::builder()
            // 1. Load default values
            // Data
            .set_default("data.path", "data/processed")?
            .set_default("data.targets", vec!["O3_target", "NO2_target"])?
            // Split
            .set_default("split.train_ratio", 0.7)?
            .set_default("split.val_ratio", 0.15)?
            .set_default("split.test_ratio", 0.15)?
            // Features
            .set_default("features.temperature_unit", "auto")?
            .set_default("features.reference_latitude", 28.6)?
            // Quality
            .set_default("quality.handle_outliers", true)?
            .set_default("quality.outlier_method", "iqr")?
            .set_default("quality.outlier_factor", 2.0)?
            .set_default("quality.smooth", true)?
            .set_default("quality.smoothing_window", 5)?
            .set_default("quality.smoothing_polyorder", 2)?
            .set_default("quality.robust_stats", true)?
            .set_default("quality.interactions", true)?
            .set_default("quality.lags", true)?
            .set_default("quality.scaling_method", "robust")?
            // Model
            .set_default("model.model_name", "AdvancedLSTM")?
            .set_default("model.lstm_units", 256)?
            .set_default("model.num_layers", 4)?
            .set_default("model.dropout_rate", 0.3)?
            .set_default("model.learning_rate", 0.0003)?
            .set_default("model.attention_heads", 12)?
            .set_default("model.cnn_filters", 64)?
            .set_default("model.l1_reg", 1e-5)?
            .set_default("model.l2_reg", 1e-4)?
            .set_default("model.use_attention", true)?
            .set_default("model.use_cnn", true)?
            .set_default("model.use_bidirectional", true)?
            .set_default("model.use_residual", true)?
            // Training
            .set_default("training.sequence_length", 72)?
            .set_default("training.forecast_horizon", 48)?
            .set_default("training.epochs", 200)?
            .set_default("training.batch_size", 64)?
            .set_default("training.patience", 25)?
            .set_default("training.augment", true)?
            .set_default("training.augment_factor", 0.1)?
            .set_default("training.mc_samples", 100)?
            .set_default("training.seed", 42)?
            .set_default("training.search_epochs", 50)?
            .set_default("training.search_trials", 10)?
            // Tracking
            .set_default("tracking.enabled", true)?
            .set_default("tracking.uri", "http://localhost:5000")?
            .set_default("tracking.experiment_name", "air_quality_forecasting")?
            // Network
            .set_default("network.request_timeout_secs", 30)?
            .set_default("network.connect_timeout_secs", 10)?
            // Paths
            .set_default("paths.model_dir", "models")?
            .set_default("paths.plots_dir", "plots")?
            .set_default("paths.checkpoint_dir", None::<String>)?
            // Service
            .set_default("service.model_path", None::<String>)?
            .set_default("service.heuristic_fallback", false)?
            .set_default("service.region.lat_min", 28.4)?
            .set_default("service.region.lat_max", 28.9)?
            .set_default("service.region.lon_min", 76.8)?
            .set_default("service.region.lon_max", 77.5)?
            .set_default("service.sites", Vec::<String>::new())?
            // 2. Load from local config file (optional, lowest priority)
            .add_source(File::from(PathBuf::from("config.toml")).required(false))
            // 3. Load from user config directory (optional, overrides local)
            .add_source(File::from(config_dir.join("config.toml")).required(false))
            // 4. Load from Environment variables (AQF__MODEL__LSTM_UNITS=...)
            .add_source(Environment::with_prefix("AQF").separator("__"));

        let s = builder.build().context("Failed to assemble configuration sources")?;
        let config: Self = s
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline meaningless.
    pub fn validate(&self) -> Result<()> {
        let ratios = [
            ("train_ratio", self.split.train_ratio),
            ("val_ratio", self.split.val_ratio),
            ("test_ratio", self.split.test_ratio),
        ];
        if let Some((name, value)) = ratios.iter().find(|(_, r)| !(0.0..=1.0).contains(r)) {
            anyhow::bail!("split.{name} must lie in [0, 1], got {value}");
        }
        let sum = self.split.train_ratio + self.split.val_ratio + self.split.test_ratio;
        if (sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("split ratios must sum to 1.0, got {sum}");
        }
        if self.training.sequence_length == 0 || self.training.forecast_horizon == 0 {
            anyhow::bail!("sequence_length and forecast_horizon must be positive");
        }
        if self.training.epochs == 0 || self.training.search_epochs == 0 {
            anyhow::bail!("training.epochs and training.search_epochs must be positive");
        }
        if self.training.batch_size == 0 {
            anyhow::bail!("training.batch_size must be positive");
        }
        if self.quality.smoothing_window <= self.quality.smoothing_polyorder {
            anyhow::bail!(
                "smoothing_window ({}) must exceed smoothing_polyorder ({})",
                self.quality.smoothing_window,
                self.quality.smoothing_polyorder
            );
        }
        if self.data.targets.is_empty() {
            anyhow::bail!("at least one target column is required");
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            split: SplitConfig::default(),
            features: FeatureSettings::default(),
            quality: QualityOptions::default(),
            model: ModelParams::default(),
            training: TrainingConfig::default(),
            tracking: TrackingConfig::default(),
            network: NetworkConfig::default(),
            paths: PathsConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Default Value Tests ====================

    #[test]
    fn test_split_config_defaults_sum_to_one() {
        let split = SplitConfig::default();
        let sum = split.train_ratio + split.val_ratio + split.test_ratio;
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_training_config_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.sequence_length, 72);
        assert_eq!(config.forecast_horizon, 48);
        assert_eq!(config.epochs, 200);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.patience, 25);
        assert_eq!(config.mc_samples, 100);
    }

    #[test]
    fn test_tracking_config_defaults() {
        let config = TrackingConfig::default();
        assert!(config.enabled);
        assert_eq!(config.uri, "http://localhost:5000");
        assert_eq!(config.experiment_name, "air_quality_forecasting");
    }

    #[test]
    fn test_region_defaults_cover_delhi() {
        let region = RegionConfig::default();
        assert!(region.lat_min < 28.6 && 28.6 < region.lat_max);
        assert!(region.lon_min < 77.2 && 77.2 < region.lon_max);
    }

    #[test]
    fn test_service_fallback_disabled_by_default() {
        let config = ServiceConfig::default();
        assert!(!config.heuristic_fallback);
        assert!(config.sites.is_empty());
    }

    // ==================== Config Loading Tests ====================

    #[test]
    fn test_config_load_with_defaults() {
        let result = AppConfig::load();
        assert!(result.is_ok(), "load failed: {:?}", result.err());
    }

    #[test]
    fn test_loaded_config_matches_struct_defaults() {
        let loaded = AppConfig::load().expect("Config should load");
        let defaults = AppConfig::default();

        // Fields overridden by the env tests below are left out; they run in parallel.
        assert_eq!(loaded.data.targets, defaults.data.targets);
        assert_eq!(loaded.model.attention_heads, defaults.model.attention_heads);
        assert_eq!(loaded.model.num_layers, defaults.model.num_layers);
        assert_eq!(
            loaded.quality.smoothing_window,
            defaults.quality.smoothing_window
        );
        assert_eq!(
            loaded.features.temperature_unit,
            defaults.features.temperature_unit
        );
        assert_eq!(
            loaded.training.forecast_horizon,
            defaults.training.forecast_horizon
        );
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_validate_rejects_bad_ratios() {
        let mut config = AppConfig::default();
        config.split.test_ratio = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_ratios_summing_to_one() {
        let mut config = AppConfig::default();
        config.split.train_ratio = 1.2;
        config.split.val_ratio = -0.1;
        config.split.test_ratio = -0.1;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("train_ratio"), "{err}");
    }

    #[test]
    fn test_validate_rejects_zero_epochs_and_batch_size() {
        let mut config = AppConfig::default();
        config.training.epochs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.search_epochs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().unwrap_err().to_string().contains("batch_size"));
    }

    #[test]
    fn test_validate_rejects_window_not_above_polyorder() {
        let mut config = AppConfig::default();
        config.quality.smoothing_window = 2;
        config.quality.smoothing_polyorder = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(AppConfig::default().validate().is_ok());
    }

    // ==================== Environment Variable Override Tests ====================

    /// Helper to safely set and remove environment variables in tests.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        // SAFETY: Test environment, keys are unique per test
        unsafe {
            std::env::set_var(key, value);
        }
        let result = f();
        unsafe {
            std::env::remove_var(key);
        }
        result
    }

    #[test]
    fn test_env_var_overrides_lstm_units() {
        let config = with_env_var("AQF__MODEL__LSTM_UNITS", "32", || {
            AppConfig::load().expect("Config should load")
        });
        assert_eq!(config.model.lstm_units, 32);
    }

    #[test]
    fn test_env_var_overrides_scaling_method() {
        let config = with_env_var("AQF__QUALITY__SCALING_METHOD", "power", || {
            AppConfig::load().expect("Config should load")
        });
        assert_eq!(config.quality.scaling_method, ScalingMethod::Power);
    }

    #[test]
    fn test_env_var_overrides_outlier_method() {
        let config = with_env_var("AQF__QUALITY__OUTLIER_METHOD", "zscore", || {
            AppConfig::load().expect("Config should load")
        });
        assert_eq!(config.quality.outlier_method, OutlierMethod::ZScore);
    }
}
