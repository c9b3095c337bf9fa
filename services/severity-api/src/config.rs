use crate::loader::SourceKind;
use anyhow::Result;
use serde::Deserialize;
use severity_core::{load_config, RegistrySettings};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub path: String,
    /// Expected SHA-256 of the local artifact; empty disables the check.
    pub sha256: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self { Self { path: "models/model.json".into(), sha256: None } }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub service_name: String,
    pub log_level: String,
    pub bind_addr: String,
    pub default_source: SourceKind,
    pub warm_on_start: bool,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
}

impl ApiConfig {
    pub async fn load() -> Result<Self> {
        let mut cfg: Self = load_config("severity-api", |b| {
            b.set_default("bind_addr", "0.0.0.0:8000")?
                .set_default("default_source", "local")?
                .set_default("warm_on_start", true)
        })
        .await?;
        cfg.registry = cfg.registry.with_legacy_env();
        Ok(cfg)
    }
}
