//! Offline scoring of a bug-report CSV with a local or registry model.

use anyhow::{Context, Result};
use severity_core::{MlflowRegistry, ModelRegistry, Predictor, RegistryError, RegistrySettings, ScoringTable, SeverityModel};
use severity_resilience::{retry_async_when, RetryPolicy};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub enum ModelSource {
    Local(PathBuf),
    Registry(RegistrySettings),
}

/// Loaded model plus a one-line description of where it came from.
pub struct ScoringModel {
    pub model: SeverityModel,
    pub provenance: String,
}

pub async fn load_model(source: &ModelSource, policy: RetryPolicy) -> Result<ScoringModel> {
    match source {
        ModelSource::Local(path) => {
            let bytes = tokio::fs::read(path).await.with_context(|| format!("read model {}", path.display()))?;
            let model = SeverityModel::from_json(&bytes).with_context(|| format!("decode model {}", path.display()))?;
            Ok(ScoringModel { model, provenance: format!("local {}", path.display()) })
        }
        ModelSource::Registry(settings) => {
            let registry = MlflowRegistry::from_settings(settings)?;
            let fetched = retry_async_when(
                policy,
                || registry.fetch(&settings.model_name, &settings.model_stage),
                RegistryError::is_transient,
            )
            .await?;
            let provenance = format!("{} version {} ({}, sha256 {})", fetched.model_uri, fetched.version, fetched.tracking_uri, fetched.sha256);
            Ok(ScoringModel { model: fetched.model, provenance })
        }
    }
}

/// One prediction per input row, in row order. Rows with no text get the
/// label the model falls back to for an empty document.
pub fn score(table: &ScoringTable, predictor: &dyn Predictor) -> Result<Vec<String>> {
    let blank = table.texts.iter().filter(|t| t.is_empty()).count();
    if blank > 0 { warn!(blank, "rows with empty title and description"); }
    let predictions = predictor.predict(&table.texts)?;
    info!(rows = table.len(), "batch scored");
    Ok(predictions)
}
