//! Air-quality forecasting library
//!
//! Feature engineering, data quality, sequence assembly, the deep forecasting
//! model, training orchestration, evaluation and the prediction service.

pub mod config;
pub mod evaluation;
pub mod features;
pub mod frame;
pub mod ml;
pub mod quality;
pub mod recipe;
pub mod sequence;
pub mod series;
pub mod service;
pub mod traits;
pub mod training;

// Re-export commonly used types
pub use config::AppConfig;
pub use evaluation::{MetricsReport, calculate_metrics, calculate_sequence_metrics, compare_models};
pub use frame::{Frame, FrameError};
pub use ml::persistence::{ModelBundle, load_bundle, save_bundle};
pub use ml::{FitOptions, ForecastModel, ModelError, ModelParams};
pub use quality::{DataQualityEnhancer, QualityOptions};
pub use recipe::FeatureRecipe;
pub use sequence::{Sequences, chronological_split, make_sequences};
pub use service::{
    ForecastService, HeuristicPatternPredictor, LearnedModelPredictor, Location, PredictionResult,
    Predictor, ServiceError, ServiceRegion,
};
pub use traits::{Clock, MockClock, SystemClock};
pub use training::{ModelTrainer, PreparedData, TrainingError, TrainingOutcome};
