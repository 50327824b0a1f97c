//! MLflow experiment tracking over the REST API.
//!
//! Tracking is best effort: [`Tracker`] logs a warning on the first failure
//! and stops talking to the server for the rest of the process.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{NetworkConfig, TrackingConfig};

const API_PREFIX: &str = "api/2.0/mlflow";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    pub timestamp: i64,
    pub step: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentResponse {
    experiment: Experiment,
}

#[derive(Debug, Deserialize)]
struct Experiment {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct Run {
    info: RunInfo,
}

#[derive(Debug, Deserialize)]
struct RunInfo {
    run_id: String,
}

/// Thin blocking client for the MLflow tracking server.
#[derive(Clone, Debug)]
pub struct TrackingClient {
    client: Client,
    base: Url,
}

impl TrackingClient {
    pub fn new(uri: &str, network_config: &NetworkConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(network_config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(network_config.connect_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        let mut base = Url::parse(uri).with_context(|| format!("Invalid tracking URI {uri}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { client, base })
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        self.base
            .join(&format!("{API_PREFIX}/{name}"))
            .context("Failed to build tracking endpoint URL")
    }

    fn post<T: for<'de> Deserialize<'de>>(&self, name: &str, body: serde_json::Value) -> Result<T> {
        let response = self
            .client
            .post(self.endpoint(name)?)
            .json(&body)
            .send()
            .with_context(|| format!("Failed to send {name} request"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Tracking server returned {status} for {name}");
        }
        response
            .json::<T>()
            .with_context(|| format!("Failed to parse {name} response"))
    }

    /// Experiment id for `name`, or `None` when the server does not know it.
    pub fn get_experiment_by_name(&self, name: &str) -> Result<Option<String>> {
        let url = Url::parse_with_params(
            self.endpoint("experiments/get-by-name")?.as_str(),
            &[("experiment_name", name)],
        )
        .context("Failed to build experiment lookup URL")?;
        let response = self
            .client
            .get(url)
            .send()
            .context("Failed to send experiment lookup")?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            anyhow::bail!("Tracking server returned {status} for experiment lookup");
        }
        let body = response
            .json::<ExperimentResponse>()
            .context("Failed to parse experiment lookup")?;
        Ok(Some(body.experiment.experiment_id))
    }

    pub fn create_experiment(&self, name: &str) -> Result<String> {
        let body: CreateExperimentResponse =
            self.post("experiments/create", json!({ "name": name }))?;
        Ok(body.experiment_id)
    }

    /// Look the experiment up, creating it when missing.
    pub fn ensure_experiment(&self, name: &str) -> Result<String> {
        match self.get_experiment_by_name(name)? {
            Some(id) => Ok(id),
            None => self.create_experiment(name),
        }
    }

    pub fn create_run(&self, experiment_id: &str, run_name: &str) -> Result<String> {
        let body: CreateRunResponse = self.post(
            "runs/create",
            json!({
                "experiment_id": experiment_id,
                "run_name": run_name,
                "start_time": Utc::now().timestamp_millis(),
            }),
        )?;
        Ok(body.run.info.run_id)
    }

    pub fn log_batch(&self, run_id: &str, metrics: &[Metric], params: &[Param]) -> Result<()> {
        let _: serde_json::Value = self.post(
            "runs/log-batch",
            json!({ "run_id": run_id, "metrics": metrics, "params": params }),
        )?;
        Ok(())
    }

    pub fn finish_run(&self, run_id: &str, status: &str) -> Result<()> {
        let _: serde_json::Value = self.post(
            "runs/update",
            json!({
                "run_id": run_id,
                "status": status,
                "end_time": Utc::now().timestamp_millis(),
            }),
        )?;
        Ok(())
    }
}

/// A run to record: parameters plus metric points.
#[derive(Debug, Clone, Default)]
pub struct RunRecord {
    pub params: Vec<Param>,
    pub metrics: Vec<Metric>,
}

impl RunRecord {
    pub fn param(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.params.push(Param {
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    /// Non-finite values are dropped since JSON cannot carry them.
    pub fn metric(&mut self, key: impl Into<String>, value: f64, step: i64) -> &mut Self {
        if value.is_finite() {
            self.metrics.push(Metric {
                key: key.into(),
                value,
                timestamp: Utc::now().timestamp_millis(),
                step,
            });
        }
        self
    }
}

/// Best-effort tracking session that disables itself after a failure.
#[derive(Debug)]
pub struct Tracker {
    client: Option<TrackingClient>,
    experiment_name: String,
    experiment_id: Option<String>,
}

impl Tracker {
    pub fn new(config: &TrackingConfig, network_config: &NetworkConfig) -> Self {
        let client = if config.enabled {
            match TrackingClient::new(&config.uri, network_config) {
                Ok(client) => Some(client),
                Err(e) => {
                    tracing::warn!(error = %e, "Experiment tracking unavailable");
                    None
                }
            }
        } else {
            None
        };
        Self {
            client,
            experiment_name: config.experiment_name.clone(),
            experiment_id: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            client: None,
            experiment_name: String::new(),
            experiment_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.client.is_some()
    }

    /// Record a finished run. Returns the run id when it was stored.
    pub fn log_run(&mut self, run_name: &str, record: &RunRecord) -> Option<String> {
        let client = self.client.as_ref()?;
        let result = (|| -> Result<String> {
            let experiment_id = match &self.experiment_id {
                Some(id) => id.clone(),
                None => client.ensure_experiment(&self.experiment_name)?,
            };
            self.experiment_id = Some(experiment_id.clone());
            let run_id = client.create_run(&experiment_id, run_name)?;
            // MLflow caps a batch at 1000 metrics
            for chunk in record.metrics.chunks(1000) {
                client.log_batch(&run_id, chunk, &[])?;
            }
            client.log_batch(&run_id, &[], &record.params)?;
            client.finish_run(&run_id, "FINISHED")?;
            Ok(run_id)
        })();

        match result {
            Ok(run_id) => {
                tracing::info!(run = run_name, run_id = %run_id, "Logged tracking run");
                Some(run_id)
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "Experiment tracking failed, disabling");
                self.client = None;
                None
            }
        }
    }
}
