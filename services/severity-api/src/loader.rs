//! Model sources: the local artifact file and the remote registry.
//!
//! A loader performs exactly one attempt per call and never caches; caching
//! and single-flight belong to the resolver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use severity_core::{sha256_hex, ModelRegistry, Predictor, RegistryError, SeverityModel};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind { Local, Registry }

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self { Self::Local => "local", Self::Registry => "registry" }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Provenance of a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMeta {
    pub source: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_uri: Option<String>,
    pub sha256: String,
    pub labels: Vec<String>,
    pub loaded_at: String,
}

/// A usable predictor plus where it came from. Immutable once built.
#[derive(Clone)]
pub struct ModelHandle {
    pub predictor: Arc<dyn Predictor>,
    pub meta: ModelMeta,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_struct("ModelHandle").field("meta", &self.meta).finish_non_exhaustive() }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model artifact not found at {path}")]
    ArtifactMissing { path: PathBuf },
    #[error("model artifact at {path} is corrupt: {reason}")]
    ArtifactCorrupt { path: PathBuf, reason: String },
    #[error("registry not configured (set SEVERITY__REGISTRY__TRACKING_URI or MLFLOW_TRACKING_URI)")]
    RegistryNotConfigured,
    #[error("registry unavailable for {model_uri}: {source}")]
    Registry { model_uri: String, #[source] source: RegistryError },
    #[error("registry fetch for {model_uri} timed out after {timeout:?}")]
    Timeout { model_uri: String, timeout: Duration },
}

impl LoadError {
    /// Outcome label shared by logs and the load counter.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::ArtifactMissing { .. } => "missing",
            Self::ArtifactCorrupt { .. } => "corrupt",
            Self::RegistryNotConfigured => "not_configured",
            Self::Registry { source, .. } => source.kind(),
            Self::Timeout { .. } => "timeout",
        }
    }

    /// Broken artifacts, as opposed to "not there yet" or "try again later".
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Self::ArtifactCorrupt { .. } | Self::Registry { source: RegistryError::InvalidArtifact { .. }, .. })
    }
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    fn kind(&self) -> SourceKind;
    /// Human-readable location for logs (path or `models:/name/stage`).
    fn describe(&self) -> String;
    async fn load(&self) -> Result<ModelHandle, LoadError>;
}

fn now_rfc3339() -> String { chrono::Utc::now().to_rfc3339() }

pub struct LocalArtifactLoader {
    path: PathBuf,
    expected_sha256: Option<String>,
}

impl LocalArtifactLoader {
    pub fn new(path: impl Into<PathBuf>, expected_sha256: Option<String>) -> Self {
        Self { path: path.into(), expected_sha256: expected_sha256.filter(|s| !s.is_empty()) }
    }
}

#[async_trait]
impl ModelLoader for LocalArtifactLoader {
    fn kind(&self) -> SourceKind { SourceKind::Local }

    fn describe(&self) -> String { self.path.display().to_string() }

    async fn load(&self) -> Result<ModelHandle, LoadError> {
        let corrupt = |reason: String| LoadError::ArtifactCorrupt { path: self.path.clone(), reason };
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(LoadError::ArtifactMissing { path: self.path.clone() }),
            Err(e) => return Err(corrupt(format!("read failed: {e}"))),
        };
        let got = sha256_hex(&bytes);
        if let Some(expect) = &self.expected_sha256 {
            if !expect.eq_ignore_ascii_case(&got) { return Err(corrupt(format!("sha256 mismatch expected={expect} got={got}"))); }
        }
        let model = SeverityModel::from_json(&bytes).map_err(|e| corrupt(e.to_string()))?;
        let meta = ModelMeta {
            source: SourceKind::Local,
            path: Some(self.describe()),
            name: None,
            stage: None,
            version: None,
            model_uri: None,
            tracking_uri: None,
            sha256: got,
            labels: model.labels.clone(),
            loaded_at: now_rfc3339(),
        };
        Ok(ModelHandle { predictor: Arc::new(model), meta })
    }
}

pub struct RegistryLoader {
    registry: Option<Arc<dyn ModelRegistry>>,
    name: String,
    stage: String,
    timeout: Duration,
}

impl RegistryLoader {
    /// `registry` is `None` when no tracking URI was configured.
    pub fn new(registry: Option<Arc<dyn ModelRegistry>>, name: impl Into<String>, stage: impl Into<String>, timeout: Duration) -> Self {
        Self { registry, name: name.into(), stage: stage.into(), timeout }
    }
}

#[async_trait]
impl ModelLoader for RegistryLoader {
    fn kind(&self) -> SourceKind { SourceKind::Registry }

    fn describe(&self) -> String { severity_core::registry::model_uri(&self.name, &self.stage) }

    async fn load(&self) -> Result<ModelHandle, LoadError> {
        let registry = self.registry.as_ref().ok_or(LoadError::RegistryNotConfigured)?;
        let fetched = match tokio::time::timeout(self.timeout, registry.fetch(&self.name, &self.stage)).await {
            Err(_) => return Err(LoadError::Timeout { model_uri: self.describe(), timeout: self.timeout }),
            Ok(Err(source)) => return Err(LoadError::Registry { model_uri: self.describe(), source }),
            Ok(Ok(m)) => m,
        };
        let meta = ModelMeta {
            source: SourceKind::Registry,
            path: None,
            name: Some(fetched.name),
            stage: Some(fetched.stage),
            version: Some(fetched.version),
            model_uri: Some(fetched.model_uri),
            tracking_uri: Some(fetched.tracking_uri),
            sha256: fetched.sha256,
            labels: fetched.model.labels.clone(),
            loaded_at: now_rfc3339(),
        };
        Ok(ModelHandle { predictor: Arc::new(fetched.model), meta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use severity_core::{RegistryModel, TrainConfig};

    fn model_bytes(labels: &[&str]) -> Vec<u8> {
        let texts: Vec<String> = labels.iter().map(|l| format!("{l} sample report")).collect();
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        SeverityModel::fit(&texts, &labels, &TrainConfig::default()).unwrap().to_json_vec().unwrap()
    }

    #[tokio::test]
    async fn missing_file_is_distinct_from_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let loader = LocalArtifactLoader::new(&path, None);
        let err = loader.load().await.unwrap_err();
        assert_eq!(err.outcome(), "missing");
        assert!(!err.is_anomaly());

        std::fs::write(&path, b"garbage").unwrap();
        let err = loader.load().await.unwrap_err();
        assert_eq!(err.outcome(), "corrupt");
        assert!(err.is_anomaly());
    }

    #[tokio::test]
    async fn local_load_records_provenance_and_checks_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let bytes = model_bytes(&["minor", "critical"]);
        std::fs::write(&path, &bytes).unwrap();

        let handle = LocalArtifactLoader::new(&path, Some(sha256_hex(&bytes).to_uppercase())).load().await.unwrap();
        assert_eq!(handle.meta.source, SourceKind::Local);
        assert_eq!(handle.meta.path.as_deref(), Some(path.display().to_string().as_str()));
        assert_eq!(handle.meta.labels, vec!["critical", "minor"]);

        let err = LocalArtifactLoader::new(&path, Some("deadbeef".into())).load().await.unwrap_err();
        assert!(err.to_string().contains("sha256 mismatch"));
    }

    struct SlowRegistry(Duration);

    #[async_trait]
    impl ModelRegistry for SlowRegistry {
        async fn fetch(&self, name: &str, stage: &str) -> Result<RegistryModel, RegistryError> {
            tokio::time::sleep(self.0).await;
            Err(RegistryError::NotFound { name: name.into(), stage: stage.into() })
        }
    }

    #[tokio::test]
    async fn registry_loader_without_registry_is_not_configured() {
        let loader = RegistryLoader::new(None, "m", "Production", Duration::from_secs(1));
        assert_eq!(loader.load().await.unwrap_err().outcome(), "not_configured");
        assert_eq!(loader.describe(), "models:/m/Production");
    }

    #[tokio::test]
    async fn registry_fetch_is_bounded_by_timeout() {
        let loader = RegistryLoader::new(Some(Arc::new(SlowRegistry(Duration::from_secs(5)))), "m", "Production", Duration::from_millis(20));
        assert_eq!(loader.load().await.unwrap_err().outcome(), "timeout");
        let loader = RegistryLoader::new(Some(Arc::new(SlowRegistry(Duration::from_millis(1)))), "m", "Production", Duration::from_secs(1));
        assert_eq!(loader.load().await.unwrap_err().outcome(), "not_found");
    }
}
