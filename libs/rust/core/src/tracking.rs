//! Experiment tracking against the MLflow REST API.
//!
//! One training run becomes one MLflow run: params and metrics go through
//! `runs/log-batch`, files are uploaded under the run's artifact root, and
//! the run is closed as `FINISHED` (or `FAILED` when any step errors).

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::registry::{MlflowRegistry, RegistryError, ARTIFACTS};

/// Everything recorded for one run. Artifact paths are relative to the run's
/// artifact root, e.g. `artifacts/metrics.json`.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    pub params: Vec<(String, String)>,
    pub metrics: Vec<(String, f64)>,
    pub artifacts: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRun {
    pub experiment_id: String,
    pub run_id: String,
    pub artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentRecord { experiment_id: String }

#[derive(Debug, Deserialize)]
struct FoundExperiment { experiment: ExperimentRecord }

#[derive(Debug, Deserialize)]
struct RunInfo { run_id: String, #[serde(default)] artifact_uri: String }

#[derive(Debug, Deserialize)]
struct RunRecord { info: RunInfo }

#[derive(Debug, Deserialize)]
struct CreatedRun { run: RunRecord }

fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }

async fn decode<T: DeserializeOwned>(endpoint: &str, resp: reqwest::Response) -> Result<T, RegistryError> {
    let status = resp.status().as_u16();
    resp.json().await.map_err(|e| RegistryError::Http {
        endpoint: endpoint.to_string(),
        status,
        body: format!("unexpected response: {e}"),
    })
}

impl MlflowRegistry {
    /// Id of the experiment called `name`, created on first use.
    pub async fn experiment_id(&self, name: &str) -> Result<String, RegistryError> {
        let endpoint = self.api_url("experiments/get-by-name");
        let resp = self
            .client()
            .get(&endpoint)
            .query(&[("experiment_name", name)])
            .send()
            .await
            .map_err(|source| RegistryError::Unreachable { endpoint: endpoint.clone(), source })?;
        if resp.status().is_success() {
            let found: FoundExperiment = decode(&endpoint, resp).await?;
            return Ok(found.experiment.experiment_id);
        }
        if resp.status() != reqwest::StatusCode::NOT_FOUND { return Err(Self::http_error(&endpoint, resp).await); }

        let endpoint = self.api_url("experiments/create");
        let resp = self.post_json("experiments/create", json!({ "name": name })).await?;
        if !resp.status().is_success() { return Err(Self::http_error(&endpoint, resp).await); }
        let created: ExperimentRecord = decode(&endpoint, resp).await?;
        info!(experiment = name, experiment_id = %created.experiment_id, "created experiment");
        Ok(created.experiment_id)
    }

    /// Record `log` as a new run of `experiment` and close it.
    pub async fn log_run(&self, experiment: &str, run_name: Option<&str>, log: &RunLog) -> Result<LoggedRun, RegistryError> {
        let experiment_id = self.experiment_id(experiment).await?;

        let mut body = json!({ "experiment_id": experiment_id, "start_time": now_ms() });
        if let Some(name) = run_name {
            body["run_name"] = json!(name);
            body["tags"] = json!([{ "key": "mlflow.runName", "value": name }]);
        }
        let endpoint = self.api_url("runs/create");
        let resp = self.post_json("runs/create", body).await?;
        if !resp.status().is_success() { return Err(Self::http_error(&endpoint, resp).await); }
        let created: CreatedRun = decode(&endpoint, resp).await?;
        let RunInfo { run_id, artifact_uri } = created.run.info;
        debug!(%run_id, %artifact_uri, "run created");

        match self.fill_run(&experiment_id, &run_id, &artifact_uri, log).await {
            Ok(()) => {
                self.close_run(&run_id, "FINISHED").await?;
                info!(experiment, %run_id, params = log.params.len(), metrics = log.metrics.len(), artifacts = log.artifacts.len(), "run logged");
                Ok(LoggedRun { experiment_id, run_id, artifact_uri })
            }
            Err(e) => {
                if let Err(close) = self.close_run(&run_id, "FAILED").await {
                    warn!(%run_id, error = %close, "could not mark run failed");
                }
                Err(e)
            }
        }
    }

    async fn fill_run(&self, experiment_id: &str, run_id: &str, artifact_uri: &str, log: &RunLog) -> Result<(), RegistryError> {
        let timestamp = now_ms();
        let metrics: Vec<_> = log
            .metrics
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value, "timestamp": timestamp, "step": 0 }))
            .collect();
        let params: Vec<_> = log.params.iter().map(|(key, value)| json!({ "key": key, "value": value })).collect();
        let endpoint = self.api_url("runs/log-batch");
        let resp = self.post_json("runs/log-batch", json!({ "run_id": run_id, "metrics": metrics, "params": params })).await?;
        if !resp.status().is_success() { return Err(Self::http_error(&endpoint, resp).await); }

        // Roots outside the artifact proxy (s3, file) are not writable from here.
        let root = self.artifact_url(artifact_uri).unwrap_or_else(|| {
            debug!(%artifact_uri, "artifact root not reachable over HTTP; using the proxy path");
            format!("{}/{ARTIFACTS}/{experiment_id}/{run_id}/artifacts", self.tracking_uri())
        });
        for (path, bytes) in &log.artifacts {
            let url = format!("{}/{}", root.trim_end_matches('/'), path.trim_start_matches('/'));
            let resp = self
                .client()
                .put(&url)
                .body(bytes.clone())
                .send()
                .await
                .map_err(|source| RegistryError::Unreachable { endpoint: url.clone(), source })?;
            if !resp.status().is_success() { return Err(Self::http_error(&url, resp).await); }
        }
        Ok(())
    }

    async fn close_run(&self, run_id: &str, status: &str) -> Result<(), RegistryError> {
        let endpoint = self.api_url("runs/update");
        let resp = self.post_json("runs/update", json!({ "run_id": run_id, "status": status, "end_time": now_ms() })).await?;
        if !resp.status().is_success() { return Err(Self::http_error(&endpoint, resp).await); }
        Ok(())
    }
}
