//! Feature builders over raw observations.
//!
//! Every builder is a pure `Frame -> Frame` function. The only state is what
//! must be identical between training and inference: the resolved temperature
//! unit and the pollutant maxima behind `combined_pollution_index`. That state
//! is learned once by [`FeatureEngineer::fit`] and replayed by
//! [`FeatureEngineer::transform`].

pub mod history;
pub mod meteorological;
pub mod satellite;
pub mod temporal;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::Frame;
use crate::series;

pub use history::add_target_history;
pub use meteorological::add_meteorological_features;
pub use satellite::{PollutionMaxima, add_pollution_features, add_satellite_features};
pub use temporal::add_time_features;

/// Column means above this are taken to be Kelvin by the `auto` heuristic.
const KELVIN_HEURISTIC_THRESHOLD: f64 = 100.0;
const MIN_PLAUSIBLE_KELVIN_MEAN: f64 = 150.0;
const MAX_PLAUSIBLE_CELSIUS_MEAN: f64 = 70.0;

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("temperature column mean {mean:.2} is implausible for {unit:?}")]
    ImplausibleTemperature { unit: TemperatureUnit, mean: f64 },
    #[error("feature engineer used before fit")]
    NotFitted,
}

/// Unit of the `T_forecast` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    Kelvin,
    Celsius,
    /// Decide from the data once at fit time
    #[default]
    Auto,
}

impl TemperatureUnit {
    /// Replace `Auto` with a concrete unit using the column mean.
    pub fn resolve(self, temperatures: &[f64]) -> Self {
        match self {
            Self::Auto => {
                if series::mean(temperatures) > KELVIN_HEURISTIC_THRESHOLD {
                    Self::Kelvin
                } else {
                    Self::Celsius
                }
            }
            unit => unit,
        }
    }

    /// Resolve and check that the data agrees with the unit.
    pub fn validate(self, temperatures: &[f64]) -> Result<Self, FeatureError> {
        let unit = self.resolve(temperatures);
        let mean = series::mean(temperatures);
        if mean.is_nan() {
            return Ok(unit);
        }
        let implausible = match unit {
            Self::Kelvin => mean < MIN_PLAUSIBLE_KELVIN_MEAN,
            Self::Celsius => mean > MAX_PLAUSIBLE_CELSIUS_MEAN,
            Self::Auto => false,
        };
        if implausible {
            return Err(FeatureError::ImplausibleTemperature { unit, mean });
        }
        Ok(unit)
    }

    pub fn to_celsius(self, value: f64) -> f64 {
        match self {
            Self::Kelvin => value - 273.15,
            Self::Celsius | Self::Auto => value,
        }
    }
}

/// State learned from the training frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureState {
    pub temperature_unit: TemperatureUnit,
    pub maxima: Option<PollutionMaxima>,
}

#[derive(Debug, Clone)]
pub struct FeatureEngineer {
    targets: Vec<String>,
    unit: TemperatureUnit,
    latitude: f64,
    state: Option<FeatureState>,
}

impl FeatureEngineer {
    pub fn new(targets: Vec<String>, unit: TemperatureUnit, latitude: f64) -> Self {
        Self {
            targets,
            unit,
            latitude,
            state: None,
        }
    }

    /// Rebuild a fitted engineer from persisted state.
    pub fn from_state(targets: Vec<String>, latitude: f64, state: FeatureState) -> Self {
        Self {
            targets,
            unit: state.temperature_unit,
            latitude,
            state: Some(state),
        }
    }

    pub fn state(&self) -> Option<&FeatureState> {
        self.state.as_ref()
    }

    pub fn fit(&mut self, frame: &Frame) -> Result<&FeatureState, FeatureError> {
        let temperature_unit = match frame.column("T_forecast") {
            Some(t) => self.unit.validate(t)?,
            None => self.unit.resolve(&[]),
        };
        let maxima = PollutionMaxima::fit(frame);
        tracing::info!(
            unit = ?temperature_unit,
            has_maxima = maxima.is_some(),
            "Fitted feature engineer"
        );
        Ok(&*self.state.insert(FeatureState {
            temperature_unit,
            maxima,
        }))
    }

    /// Run every builder using the fitted state.
    pub fn transform(&self, frame: Frame) -> Result<Frame, FeatureError> {
        let state = self.state.as_ref().ok_or(FeatureError::NotFitted)?;
        let frame = add_time_features(frame);
        let frame = add_meteorological_features(frame, state.temperature_unit, self.latitude);
        let frame = add_satellite_features(frame);
        let frame = add_pollution_features(frame, state.maxima);
        Ok(add_target_history(frame, &self.targets))
    }

    pub fn fit_transform(&mut self, frame: Frame) -> Result<Frame, FeatureError> {
        self.fit(&frame)?;
        self.transform(frame)
    }
}
