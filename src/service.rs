//! Location-based forecast service.
//!
//! [`ForecastService`] is constructed explicitly from configuration and
//! dispatches to a [`Predictor`]: the learned model when it is available, the
//! labelled heuristic only when fallback is enabled.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AppConfig, RegionConfig, SiteConfig};
use crate::frame::{Frame, FrameError};
use crate::ml::persistence::{ModelBundle, load_bundle};
use crate::ml::{ForecastModel, ModelError, ModelMetadata, PersistenceError};
use crate::recipe::{FeatureRecipe, RecipeError};
use crate::sequence::{SequenceError, last_window};
use crate::traits::{Clock, SystemClock};

pub const HEURISTIC_MODEL_NAME: &str = "heuristic_atmospheric_patterns";
const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("horizon must be at least one hour")]
    ZeroHorizon,
    #[error("requested {requested} hours but the model forecasts at most {max}")]
    HorizonTooLong { requested: usize, max: usize },
    #[error("no monitoring sites configured")]
    NoSites,
    #[error("no predictor available: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ServiceError {
    /// Errors caused by the request itself; these never trigger a fallback.
    pub fn is_request_error(&self) -> bool {
        matches!(self, ServiceError::ZeroHorizon | ServiceError::HorizonTooLong { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Location) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Forecast for one location; pollutant keys have the `_target` suffix removed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub predictions: BTreeMap<String, Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncertainties: Option<BTreeMap<String, Vec<f64>>>,
    pub model_used: String,
    pub model_info: serde_json::Value,
    pub location: Location,
}

pub fn pollutant_name(target: &str) -> &str {
    target.strip_suffix("_target").unwrap_or(target)
}

/// Geographic area the service is intended for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceRegion {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl ServiceRegion {
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&latitude)
            && (self.lon_min..=self.lon_max).contains(&longitude)
    }
}

impl From<RegionConfig> for ServiceRegion {
    fn from(r: RegionConfig) -> Self {
        Self {
            lat_min: r.lat_min,
            lat_max: r.lat_max,
            lon_min: r.lon_min,
            lon_max: r.lon_max,
        }
    }
}

pub trait Predictor: Send + Sync {
    fn name(&self) -> &str;

    fn predict(
        &self,
        location: Location,
        horizon: usize,
        include_uncertainty: bool,
    ) -> Result<PredictionResult, ServiceError>;
}

// ==================== Learned Model ====================

/// A monitoring site with its recent raw observations.
#[derive(Debug, Clone)]
pub struct Site {
    pub name: String,
    pub location: Location,
    pub history: Frame,
}

impl Site {
    pub fn load(config: &SiteConfig) -> Result<Self, ServiceError> {
        let history = Frame::read_csv(&config.history_path)?.sort_chronologically()?;
        Ok(Self {
            name: config.name.clone(),
            location: Location::new(config.latitude, config.longitude),
            history,
        })
    }
}

pub struct LearnedModelPredictor {
    model: Mutex<ForecastModel>,
    recipe: FeatureRecipe,
    metadata: ModelMetadata,
    sites: Vec<Site>,
    mc_samples: usize,
}

impl LearnedModelPredictor {
    pub fn new(bundle: ModelBundle, sites: Vec<Site>, mc_samples: usize) -> Result<Self, ServiceError> {
        if sites.is_empty() {
            return Err(ServiceError::NoSites);
        }
        Ok(Self {
            model: Mutex::new(bundle.model),
            recipe: bundle.recipe,
            metadata: bundle.metadata,
            sites,
            mc_samples,
        })
    }

    pub fn load(model_dir: &Path, sites: &[SiteConfig], mc_samples: usize) -> Result<Self, ServiceError> {
        let bundle = load_bundle(model_dir)?;
        let sites = sites.iter().map(Site::load).collect::<Result<Vec<_>, _>>()?;
        Self::new(bundle, sites, mc_samples)
    }

    pub fn max_horizon(&self) -> usize {
        self.metadata.output_shape.0
    }

    fn nearest_site(&self, location: &Location) -> Option<(&Site, f64)> {
        self.sites
            .iter()
            .map(|s| (s, s.location.distance_km(location)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl Predictor for LearnedModelPredictor {
    fn name(&self) -> &str {
        &self.metadata.model_name
    }

    fn predict(
        &self,
        location: Location,
        horizon: usize,
        include_uncertainty: bool,
    ) -> Result<PredictionResult, ServiceError> {
        if horizon == 0 {
            return Err(ServiceError::ZeroHorizon);
        }
        if horizon > self.max_horizon() {
            return Err(ServiceError::HorizonTooLong {
                requested: horizon,
                max: self.max_horizon(),
            });
        }
        let (site, distance) = self.nearest_site(&location).ok_or(ServiceError::NoSites)?;

        let frame = self.recipe.transform(site.history.clone())?;
        let sequence_length = self.metadata.input_shape.0;
        let window = last_window(&frame, self.recipe.feature_names(), sequence_length)?;

        let model = self
            .model
            .lock()
            .map_err(|_| ServiceError::Unavailable("model lock poisoned".to_string()))?;
        let (mean, std) = if include_uncertainty {
            let summary = model.predict_with_uncertainty(&window, self.mc_samples)?;
            (summary.mean, Some(summary.std))
        } else {
            (model.predict(&window)?, None)
        };
        drop(model);

        let column = |values: &ndarray::Array3<f32>, k: usize| -> Vec<f64> {
            (0..horizon).map(|h| f64::from(values[[0, h, k]])).collect()
        };
        let targets = self.recipe.target_names();
        let predictions = targets
            .iter()
            .enumerate()
            .map(|(k, t)| (pollutant_name(t).to_string(), column(&mean, k)))
            .collect();
        let uncertainties = std.map(|std| {
            targets
                .iter()
                .enumerate()
                .map(|(k, t)| (pollutant_name(t).to_string(), column(&std, k)))
                .collect()
        });

        info!(site = %site.name, distance_km = distance, horizon, "Learned prediction");
        Ok(PredictionResult {
            predictions,
            uncertainties,
            model_used: self.metadata.model_name.clone(),
            model_info: json!({
                "kind": "learned",
                "model_name": self.metadata.model_name,
                "created_at": self.metadata.created_at,
                "sequence_length": sequence_length,
                "max_horizon": self.max_horizon(),
                "site": site.name,
                "site_distance_km": distance,
                "mc_samples": include_uncertainty.then_some(self.mc_samples),
            }),
            location,
        })
    }
}

// ==================== Heuristic Patterns ====================

/// Multipliers and offsets describing a part of the region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationProfile {
    pub name: &'static str,
    /// `(lat_min, lat_max, lon_min, lon_max)`
    pub bounds: (f64, f64, f64, f64),
    pub pollution_factor: f64,
    pub traffic_factor: f64,
    pub o3_factor: f64,
    pub photochemical_factor: f64,
    pub base_offset: f64,
    pub o3_offset: f64,
}

/// Most specific areas first so nested boxes resolve to the inner one.
pub const LOCATION_PROFILES: [LocationProfile; 5] = [
    LocationProfile {
        name: "connaught_place",
        bounds: (28.62, 28.64, 77.20, 77.22),
        pollution_factor: 1.5,
        traffic_factor: 1.6,
        o3_factor: 0.8,
        photochemical_factor: 0.7,
        base_offset: 15.0,
        o3_offset: -8.0,
    },
    LocationProfile {
        name: "central_delhi",
        bounds: (28.60, 28.70, 77.15, 77.25),
        pollution_factor: 1.3,
        traffic_factor: 1.4,
        o3_factor: 0.9,
        photochemical_factor: 0.8,
        base_offset: 10.0,
        o3_offset: -5.0,
    },
    LocationProfile {
        name: "gurgaon",
        bounds: (28.40, 28.50, 77.00, 77.10),
        pollution_factor: 1.2,
        traffic_factor: 1.3,
        o3_factor: 1.1,
        photochemical_factor: 1.0,
        base_offset: 8.0,
        o3_offset: 2.0,
    },
    LocationProfile {
        name: "noida",
        bounds: (28.50, 28.60, 77.30, 77.40),
        pollution_factor: 1.1,
        traffic_factor: 1.2,
        o3_factor: 1.2,
        photochemical_factor: 1.1,
        base_offset: 5.0,
        o3_offset: 5.0,
    },
    LocationProfile {
        name: "dwarka",
        bounds: (28.55, 28.65, 77.00, 77.10),
        pollution_factor: 0.9,
        traffic_factor: 1.0,
        o3_factor: 1.3,
        photochemical_factor: 1.2,
        base_offset: 0.0,
        o3_offset: 8.0,
    },
];

pub const DEFAULT_PROFILE: LocationProfile = LocationProfile {
    name: "default",
    bounds: (f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY),
    pollution_factor: 1.0,
    traffic_factor: 1.0,
    o3_factor: 1.0,
    photochemical_factor: 1.0,
    base_offset: 0.0,
    o3_offset: 0.0,
};

pub fn location_profile(location: &Location) -> &'static LocationProfile {
    LOCATION_PROFILES
        .iter()
        .find(|p| {
            let (lat_min, lat_max, lon_min, lon_max) = p.bounds;
            (lat_min..=lat_max).contains(&location.latitude)
                && (lon_min..=lon_max).contains(&location.longitude)
        })
        .unwrap_or(&DEFAULT_PROFILE)
}

/// Diurnal traffic and photochemistry patterns scaled per area.
///
/// Not a trained model: every result is labelled as heuristic.
pub struct HeuristicPatternPredictor {
    clock: Arc<dyn Clock>,
}

impl HeuristicPatternPredictor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn no2_series(profile: &LocationProfile, start_hour: u32, hours: usize) -> Vec<f64> {
        let base = (50.0 + (f64::from(start_hour) - 12.0) * 2.0) * profile.pollution_factor;
        (0..hours)
            .map(|i| {
                let hour = (start_hour as usize + i) % 24;
                let time_factor = match hour {
                    7..=9 | 18..=20 => 1.4,
                    10..=17 => 1.1,
                    _ => 0.7,
                };
                let value =
                    base * profile.traffic_factor * time_factor + i as f64 * 0.3 + profile.base_offset;
                value.clamp(15.0, 120.0)
            })
            .collect()
    }

    fn o3_series(profile: &LocationProfile, start_hour: u32, hours: usize) -> Vec<f64> {
        let base = (40.0 + (14.0 - f64::from(start_hour)) * 1.5) * profile.o3_factor;
        (0..hours)
            .map(|i| {
                let hour = (start_hour as usize + i) % 24;
                let diurnal = match hour {
                    12..=16 => 1.5 * profile.photochemical_factor,
                    6..=11 => 1.2,
                    _ => 0.6,
                };
                let value = base * diurnal + i as f64 * 0.2 + profile.o3_offset;
                value.clamp(10.0, 90.0)
            })
            .collect()
    }
}

impl Default for HeuristicPatternPredictor {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Predictor for HeuristicPatternPredictor {
    fn name(&self) -> &str {
        HEURISTIC_MODEL_NAME
    }

    fn predict(
        &self,
        location: Location,
        horizon: usize,
        include_uncertainty: bool,
    ) -> Result<PredictionResult, ServiceError> {
        if horizon == 0 {
            return Err(ServiceError::ZeroHorizon);
        }
        let profile = location_profile(&location);
        let hour = self.clock.hour_utc();
        let no2 = Self::no2_series(profile, hour, horizon);
        let o3 = Self::o3_series(profile, hour, horizon);

        let uncertainties = include_uncertainty.then(|| {
            BTreeMap::from([
                ("NO2".to_string(), no2.iter().map(|v| v * 0.12).collect()),
                ("O3".to_string(), o3.iter().map(|v| v * 0.10).collect()),
            ])
        });

        Ok(PredictionResult {
            predictions: BTreeMap::from([("NO2".to_string(), no2), ("O3".to_string(), o3)]),
            uncertainties,
            model_used: HEURISTIC_MODEL_NAME.to_string(),
            model_info: json!({
                "kind": "heuristic",
                "name": HEURISTIC_MODEL_NAME,
                "location_profile": profile.name,
                "accuracy": null,
                "note": "Heuristic diurnal patterns; any accuracy figure is a placeholder, not a verified metric",
            }),
            location,
        })
    }
}

// ==================== Service ====================

pub struct ForecastService {
    learned: Option<LearnedModelPredictor>,
    fallback: Option<HeuristicPatternPredictor>,
    region: ServiceRegion,
    unavailable_reason: Option<String>,
}

impl ForecastService {
    /// Load the configured model bundle and site histories.
    ///
    /// A load failure is an error unless `service.heuristic_fallback` is set.
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let service = &config.service;
        let region = ServiceRegion::from(service.region);
        let fallback = service
            .heuristic_fallback
            .then(HeuristicPatternPredictor::default);

        let learned = match &service.model_path {
            Some(path) => LearnedModelPredictor::load(path, &service.sites, config.training.mc_samples),
            None => Err(ServiceError::Unavailable("no model_path configured".to_string())),
        };

        match learned {
            Ok(predictor) => {
                info!(model = predictor.name(), sites = predictor.sites.len(), "Forecast service ready");
                Ok(Self {
                    learned: Some(predictor),
                    fallback,
                    region,
                    unavailable_reason: None,
                })
            }
            Err(e) if fallback.is_some() => {
                warn!(error = %e, "Learned model unavailable, serving heuristic predictions");
                Ok(Self {
                    learned: None,
                    fallback,
                    region,
                    unavailable_reason: Some(e.to_string()),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn from_predictors(
        learned: Option<LearnedModelPredictor>,
        fallback: Option<HeuristicPatternPredictor>,
        region: ServiceRegion,
    ) -> Self {
        let unavailable_reason = learned
            .is_none()
            .then(|| "no learned model loaded".to_string());
        Self {
            learned,
            fallback,
            region,
            unavailable_reason,
        }
    }

    pub fn region(&self) -> ServiceRegion {
        self.region
    }

    pub fn has_learned_model(&self) -> bool {
        self.learned.is_some()
    }

    /// Forecast `horizon_hours` steps at a location.
    ///
    /// Region bounds are informational and not enforced here.
    pub fn predict(
        &self,
        latitude: f64,
        longitude: f64,
        horizon_hours: usize,
        include_uncertainty: bool,
    ) -> Result<PredictionResult, ServiceError> {
        let location = Location::new(latitude, longitude);
        if !self.region.contains(latitude, longitude) {
            warn!(latitude, longitude, "Location outside the service region");
        }

        let reason = match &self.learned {
            Some(learned) => match learned.predict(location, horizon_hours, include_uncertainty) {
                Ok(result) => return Ok(result),
                Err(e) if e.is_request_error() || self.fallback.is_none() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Learned prediction failed, using heuristic fallback");
                    e.to_string()
                }
            },
            None => self
                .unavailable_reason
                .clone()
                .unwrap_or_else(|| "no learned model loaded".to_string()),
        };

        let fallback = self
            .fallback
            .as_ref()
            .ok_or_else(|| ServiceError::Unavailable(reason.clone()))?;
        let mut result = fallback.predict(location, horizon_hours, include_uncertainty)?;
        if let Some(info) = result.model_info.as_object_mut() {
            info.insert("fallback_reason".to_string(), json!(reason));
        }
        Ok(result)
    }
}
