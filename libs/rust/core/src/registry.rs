//! Model registry client (MLflow REST subset).
//!
//! Fetch resolves `name@stage` to the newest version in that stage and
//! downloads its `model.json`. Publish uploads an artifact, registers a new
//! version and moves it into a stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::SeverityModel;
use crate::sha256_hex;

const API: &str = "api/2.0/mlflow";
pub(crate) const ARTIFACTS: &str = "api/2.0/mlflow-artifacts/artifacts";
const ARTIFACT_SCHEME: &str = "mlflow-artifacts:/";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub tracking_uri: Option<String>,
    pub model_name: String,
    pub model_stage: String,
    pub timeout_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self { Self { tracking_uri: None, model_name: "bug-severity-clf".into(), model_stage: "Production".into(), timeout_ms: 10_000 } }
}

impl RegistrySettings {
    /// Fill an unset tracking URI from `MLFLOW_TRACKING_URI`. Name and stage
    /// fall back to `MLFLOW_MODEL_NAME` / `MLFLOW_MODEL_STAGE` only when still
    /// at their defaults.
    pub fn with_legacy_env(mut self) -> Self {
        let defaults = Self::default();
        if self.tracking_uri.as_deref().map_or(true, str::is_empty) {
            self.tracking_uri = std::env::var("MLFLOW_TRACKING_URI").ok().filter(|v| !v.is_empty());
        }
        if self.model_name == defaults.model_name {
            if let Ok(v) = std::env::var("MLFLOW_MODEL_NAME") { if !v.is_empty() { self.model_name = v; } }
        }
        if self.model_stage == defaults.model_stage {
            if let Ok(v) = std::env::var("MLFLOW_MODEL_STAGE") { if !v.is_empty() { self.model_stage = v; } }
        }
        self
    }

    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }

    pub fn model_uri(&self) -> String { model_uri(&self.model_name, &self.model_stage) }
}

pub fn model_uri(name: &str, stage: &str) -> String { format!("models:/{name}/{stage}") }

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry tracking URI is not configured")]
    NotConfigured,
    #[error("cannot build registry client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("registry unreachable at {endpoint}: {source}")]
    Unreachable { endpoint: String, #[source] source: reqwest::Error },
    #[error("no version of model '{name}' in stage '{stage}'")]
    NotFound { name: String, stage: String },
    #[error("artifact at {location} is not a usable model: {reason}")]
    InvalidArtifact { location: String, reason: String },
    #[error("registry returned HTTP {status} for {endpoint}: {body}")]
    Http { endpoint: String, status: u16, body: String },
}

impl RegistryError {
    /// Stable short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Client(_) => "client",
            Self::Unreachable { .. } => "unreachable",
            Self::NotFound { .. } => "not_found",
            Self::InvalidArtifact { .. } => "invalid_artifact",
            Self::Http { .. } => "http",
        }
    }

    /// Worth retrying later without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A model fetched from the registry plus where it came from.
#[derive(Debug, Clone)]
pub struct RegistryModel {
    pub model: SeverityModel,
    pub name: String,
    pub stage: String,
    pub version: String,
    pub model_uri: String,
    pub artifact_source: String,
    pub tracking_uri: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedVersion { pub name: String, pub version: String, pub stage: String, pub source: String }

#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn fetch(&self, name: &str, stage: &str) -> Result<RegistryModel, RegistryError>;
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody { error_code: Option<String> }

#[derive(Debug, Deserialize)]
struct LatestVersions { #[serde(default)] model_versions: Vec<VersionRecord> }

#[derive(Debug, Deserialize)]
struct VersionRecord { version: String, #[serde(default)] source: String }

#[derive(Debug, Deserialize)]
struct CreatedVersion { model_version: VersionRecord }

#[derive(Clone)]
pub struct MlflowRegistry {
    client: reqwest::Client,
    tracking_uri: String,
}

impl MlflowRegistry {
    pub fn new(tracking_uri: impl Into<String>, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(RegistryError::Client)?;
        let tracking_uri = tracking_uri.into().trim_end_matches('/').to_string();
        Ok(Self { client, tracking_uri })
    }

    pub fn from_settings(settings: &RegistrySettings) -> Result<Self, RegistryError> {
        match settings.tracking_uri.as_deref() {
            Some(uri) if !uri.is_empty() => Self::new(uri, settings.timeout()),
            _ => Err(RegistryError::NotConfigured),
        }
    }

    pub fn tracking_uri(&self) -> &str { &self.tracking_uri }

    pub(crate) fn client(&self) -> &reqwest::Client { &self.client }

    pub(crate) fn api_url(&self, path: &str) -> String { format!("{}/{API}/{path}", self.tracking_uri) }

    /// `mlflow-artifacts:/p` goes through the tracking server's artifact proxy.
    pub(crate) fn artifact_url(&self, source: &str) -> Option<String> {
        if let Some(path) = source.strip_prefix(ARTIFACT_SCHEME) {
            return Some(format!("{}/{ARTIFACTS}/{}", self.tracking_uri, path.trim_start_matches('/')));
        }
        if source.starts_with("http://") || source.starts_with("https://") { return Some(source.to_string()); }
        None
    }

    pub(crate) async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response, RegistryError> {
        let endpoint = self.api_url(path);
        self.client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|source| RegistryError::Unreachable { endpoint, source })
    }

    pub(crate) async fn http_error(endpoint: &str, resp: reqwest::Response) -> RegistryError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        RegistryError::Http { endpoint: endpoint.to_string(), status, body }
    }

    /// Upload `artifact`, register it as a new version of `name` and move it
    /// into `stage`, archiving whatever was there.
    pub async fn publish(&self, name: &str, stage: &str, artifact: &[u8]) -> Result<PublishedVersion, RegistryError> {
        let path = format!("{name}/{}-{:08x}/model.json", chrono::Utc::now().format("%Y%m%dT%H%M%S%3f"), rand::random::<u32>());
        let put_url = format!("{}/{ARTIFACTS}/{path}", self.tracking_uri);
        let resp = self.client
            .put(&put_url)
            .body(artifact.to_vec())
            .send()
            .await
            .map_err(|source| RegistryError::Unreachable { endpoint: put_url.clone(), source })?;
        if !resp.status().is_success() { return Err(Self::http_error(&put_url, resp).await); }

        let resp = self.post_json("registered-models/create", json!({ "name": name })).await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            let code = serde_json::from_str::<ApiErrorBody>(&body).ok().and_then(|e| e.error_code);
            if code.as_deref() != Some("RESOURCE_ALREADY_EXISTS") {
                return Err(RegistryError::Http { endpoint: self.api_url("registered-models/create"), status, body });
            }
            debug!(name, "registered model already exists");
        }

        let source = format!("{ARTIFACT_SCHEME}{path}");
        let resp = self.post_json("model-versions/create", json!({ "name": name, "source": source })).await?;
        if !resp.status().is_success() { return Err(Self::http_error(&self.api_url("model-versions/create"), resp).await); }
        let created: CreatedVersion = resp.json().await.map_err(|e| RegistryError::Http {
            endpoint: self.api_url("model-versions/create"),
            status: 200,
            body: format!("unexpected response: {e}"),
        })?;
        let version = created.model_version.version;

        let resp = self
            .post_json(
                "model-versions/transition-stage",
                json!({ "name": name, "version": version, "stage": stage, "archive_existing_versions": true }),
            )
            .await?;
        if !resp.status().is_success() { return Err(Self::http_error(&self.api_url("model-versions/transition-stage"), resp).await); }
        info!(name, %version, stage, "published model version");
        Ok(PublishedVersion { name: name.to_string(), version, stage: stage.to_string(), source })
    }
}

#[async_trait]
impl ModelRegistry for MlflowRegistry {
    async fn fetch(&self, name: &str, stage: &str) -> Result<RegistryModel, RegistryError> {
        let endpoint = self.api_url("registered-models/get-latest-versions");
        let resp = self.post_json("registered-models/get-latest-versions", json!({ "name": name, "stages": [stage] })).await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound { name: name.to_string(), stage: stage.to_string() });
        }
        if !status.is_success() { return Err(Self::http_error(&endpoint, resp).await); }
        let listing: LatestVersions = resp.json().await.map_err(|e| RegistryError::Http {
            endpoint: endpoint.clone(),
            status: status.as_u16(),
            body: format!("unexpected response: {e}"),
        })?;
        let record = listing
            .model_versions
            .into_iter()
            .max_by_key(|v| v.version.parse::<u64>().unwrap_or(0))
            .ok_or_else(|| RegistryError::NotFound { name: name.to_string(), stage: stage.to_string() })?;

        let invalid = |reason: String| RegistryError::InvalidArtifact { location: record.source.clone(), reason };
        let url = self.artifact_url(&record.source).ok_or_else(|| invalid("unsupported artifact source scheme".into()))?;
        let resp = self.client.get(&url).send().await.map_err(|source| RegistryError::Unreachable { endpoint: url.clone(), source })?;
        if !resp.status().is_success() {
            return Err(invalid(format!("download returned HTTP {}", resp.status().as_u16())));
        }
        let bytes = resp.bytes().await.map_err(|source| RegistryError::Unreachable { endpoint: url.clone(), source })?;
        let model = SeverityModel::from_json(&bytes).map_err(|e| invalid(e.to_string()))?;
        debug!(name, stage, version = %record.version, "fetched model from registry");
        Ok(RegistryModel {
            model,
            name: name.to_string(),
            stage: stage.to_string(),
            version: record.version.clone(),
            model_uri: model_uri(name, stage),
            artifact_source: record.source.clone(),
            tracking_uri: self.tracking_uri.clone(),
            sha256: sha256_hex(&bytes),
        })
    }
}
